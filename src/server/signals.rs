//! Translates process signals into server stops.

use std::io;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use super::{SignalConfig, StopReason};

/// Watch the configured signals on a dedicated thread and report each
/// one through `on_signal`. Stop memoization makes repeats harmless.
pub(crate) fn watch(
    config: &SignalConfig,
    on_signal: impl Fn(StopReason) + Send + 'static,
) -> io::Result<()> {
    let mut wanted = Vec::new();
    if config.hangup {
        wanted.push(SIGHUP);
    }
    if config.interrupt {
        wanted.push(SIGINT);
    }
    if config.terminate {
        wanted.push(SIGTERM);
    }
    if wanted.is_empty() {
        return Ok(());
    }

    let mut signals = Signals::new(&wanted)?;
    std::thread::Builder::new()
        .name("async-serve-signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                let reason = match signal {
                    SIGHUP => StopReason::Hangup,
                    SIGINT => StopReason::Interrupt,
                    SIGTERM => StopReason::Terminate,
                    _ => continue,
                };
                log::info!("stopping on signal: {}", reason);
                on_signal(reason);
            }
        })?;
    Ok(())
}
