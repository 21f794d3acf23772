use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use pitchline_realtime::media::{ChannelCapture, MemoryPlayback, WavCapture, WavRecorder};
use pitchline_realtime::{
    CallSummary, CaptureSource, ConnectionState, FixedDevices, PlaybackSink, SessionController,
};
use tracing::Instrument;

use crate::cli::CallArgs;
use crate::config::AppConfig;
use crate::console::ConsolePrinter;

pub async fn run_call(app: AppConfig, args: CallArgs) -> Result<()> {
    let scenarios = app.scenario_table()?;
    let mut bridge = app.bridge;
    if let Some(transport) = args.transport {
        bridge = bridge.with_transport(transport);
    }
    if let Some(url) = args.relay_url {
        bridge = bridge.with_relay_url(url);
    }
    if let Some(url) = args.broker_url {
        bridge = bridge.with_broker_url(url);
    }

    // Without an input file the capture stays silent for the whole call.
    let (capture, _feeder) = match &args.input {
        Some(path) => (Arc::new(WavCapture::new(path)) as Arc<dyn CaptureSource>, None),
        None => {
            let (capture, feeder) = ChannelCapture::new(8);
            (Arc::new(capture) as Arc<dyn CaptureSource>, Some(feeder))
        }
    };
    let playback: Arc<dyn PlaybackSink> = match &args.output {
        Some(path) => Arc::new(WavRecorder::create(path)?),
        None => Arc::new(MemoryPlayback::new()),
    };

    let controller = SessionController::builder(bridge)
        .scenarios(scenarios)
        .devices(Arc::new(FixedDevices::new(capture, playback)))
        .build()?;
    let (printer, mut state) = ConsolePrinter::new();
    controller.dispatcher().subscribe(Arc::new(printer));

    let session = controller.start_call(args.scenario).await?;
    println!("calling prospect ({}), ctrl-c to hang up", args.scenario);

    let span = pitchline_telemetry::call_span(&session.id.to_string(), args.scenario.id());
    let limit = Duration::from_secs(args.duration.max(1));
    async {
        tokio::select! {
            _ = tokio::time::sleep(limit) => tracing::info!("call duration reached"),
            _ = tokio::signal::ctrl_c() => tracing::info!("hanging up"),
            _ = state.wait_for(|s| s.is_terminal()) => tracing::info!("remote ended the call"),
        }
    }
    .instrument(span)
    .await;

    let summary = match controller.end_call().await {
        Some(summary) => summary,
        None => controller.last_summary().context("call ended without a summary")?,
    };
    report(&summary);

    if let Some(path) = &args.summary {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }
    if summary.final_state == ConnectionState::Failed {
        bail!("call failed after {}s", summary.duration_secs);
    }
    Ok(())
}

fn report(summary: &CallSummary) {
    println!(
        "call {} ended {} after {}s with {} transcript line(s)",
        summary.session_id,
        summary.final_state,
        summary.duration_secs,
        summary.transcripts.len()
    );
}
