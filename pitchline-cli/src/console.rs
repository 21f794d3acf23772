//! Terminal output for a running call.

use pitchline_realtime::{
    ConnectionState, EventHandler, RealtimeError, Speaker, TranscriptEvent,
};
use tokio::sync::watch;

/// Prints final transcripts and mirrors the connection state into a watch.
pub struct ConsolePrinter {
    state: watch::Sender<ConnectionState>,
}

impl ConsolePrinter {
    pub fn new() -> (Self, watch::Receiver<ConnectionState>) {
        let (state, rx) = watch::channel(ConnectionState::Idle);
        (Self { state }, rx)
    }
}

impl EventHandler for ConsolePrinter {
    fn on_transcript(&self, transcript: &TranscriptEvent) {
        if !transcript.is_final() {
            return;
        }
        let who = match transcript.speaker {
            Speaker::User => "you",
            Speaker::Assistant => "prospect",
        };
        println!("{who:>8}: {}", transcript.text.trim());
    }

    fn on_connection_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn on_error(&self, error: &RealtimeError) {
        eprintln!("error: {error}");
    }
}
