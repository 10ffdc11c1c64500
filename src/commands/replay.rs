use crate::cli::ReplayArgs;
use crate::commands::load_config;
use crate::exit_codes;
use crate::output;
use anyhow::Context;
use bsl_engine::streaming::{load_recording, read_marker_log, SourceDescriptor};
use bsl_engine::{Anchor, Engine, EngineConfig, EngineState, Epoch, SessionInfo, SessionStats};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Extra buffer kept beyond the recording span
const BUFFER_SLACK_SECS: f64 = 1.0;

#[derive(Serialize)]
struct EpochOutput {
    /// Anchor on the recording clock
    anchor: f64,
    code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    epoch: Option<Epoch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct ReplayOutput {
    session: SessionInfo,
    stats: SessionStats,
    epochs: Vec<EpochOutput>,
}

pub async fn execute(args: ReplayArgs) -> i32 {
    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::CONFIG_ERROR;
        }
    };

    let anchors = match collect_anchors(&args) {
        Ok(anchors) => anchors,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    // the whole recording has to fit in the ring when it is replayed unpaced
    let span = match load_recording(Path::new(&args.file)).await {
        Ok((_, samples)) => match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => last.source_timestamp - first.source_timestamp,
            _ => 0.0,
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };
    if config.buffer.duration_secs < span + BUFFER_SLACK_SECS {
        log::info!(
            "Growing buffer from {} s to {} s to hold the recording",
            config.buffer.duration_secs,
            span + BUFFER_SLACK_SECS
        );
        config.buffer.duration_secs = span + BUFFER_SLACK_SECS;
    }

    let report = match replay(&args, config, anchors).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    output::emit(&report, args.compact, args.output.as_deref())
}

/// Anchors from the marker file (filtered by code) followed by `--at` times
fn collect_anchors(args: &ReplayArgs) -> anyhow::Result<Vec<(f64, Option<u32>)>> {
    let mut anchors = Vec::new();

    if let Some(path) = args.markers.as_ref() {
        let markers = read_marker_log(path)
            .with_context(|| format!("failed to read marker file {}", path))?;
        anchors.extend(
            markers
                .into_iter()
                .filter(|m| args.code.map_or(true, |code| m.code == code))
                .map(|m| (m.timestamp, Some(m.code))),
        );
    }
    anchors.extend(args.at.iter().map(|t| (*t, None)));

    if !(args.pre >= 0.0 && args.post >= 0.0) {
        anyhow::bail!("--pre and --post must be non-negative");
    }
    wait_duration(args.wait)?;
    Ok(anchors)
}

/// `--wait` as a Duration; negative, NaN and unrepresentable values are refused
fn wait_duration(secs: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("--wait {} is not a usable number of seconds", secs))
}

async fn replay(
    args: &ReplayArgs,
    config: EngineConfig,
    anchors: Vec<(f64, Option<u32>)>,
) -> anyhow::Result<ReplayOutput> {
    let engine = Engine::new(config).context("invalid engine configuration")?;
    let startup = Duration::from_millis(engine.config().inlet.connect_timeout_ms * 2);

    let id = engine.start(
        SourceDescriptor::Replay {
            path: args.file.clone(),
            realtime: args.realtime,
            linger: true,
        },
        None,
    )?;
    engine
        .wait_until(id, startup, EngineState::is_live)
        .await
        .context("replay did not start streaming")?;

    let wait = wait_duration(args.wait)?;
    let mut epochs = Vec::with_capacity(anchors.len());
    for (at, code) in anchors {
        let result = engine
            .wait_for_epoch(id, Anchor::source_time(at), args.pre, args.post, wait)
            .await;
        let (epoch, error) = match result {
            Ok(epoch) => (Some(epoch), None),
            Err(e) => {
                log::warn!("No epoch at {:.6}: {}", at, e);
                (None, Some(e.to_string()))
            }
        };
        epochs.push(EpochOutput {
            anchor: at,
            code,
            epoch,
            error,
        });
    }

    let report = ReplayOutput {
        session: engine.session_info(id)?,
        stats: engine.stats(id)?,
        epochs,
    };
    engine.stop(id).await?;

    Ok(report)
}
