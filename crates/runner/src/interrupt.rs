//! Operator signals
//!
//! A run races against the first interrupt or termination signal. When the
//! signal wins, the run is abandoned where it stands and everything the
//! environment still tracks is cleaned, unless the operator asks to keep it.

use sightline_common::Result;
use sightline_vm::Environment;
use std::future::Future;
use std::io::{BufRead, Write};
use tracing::{error, warn};

use crate::descriptor::TestDescriptor;
use crate::orchestrator::Orchestrator;
use crate::report::RunReport;

pub const EXIT_FAILED: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

/// Signal that ended a run early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ctrl-C from the operator's terminal
    Interrupt,
    /// SIGTERM or SIGHUP
    Terminate,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Interrupt => write!(f, "interrupt"),
            Signal::Terminate => write!(f, "termination signal"),
        }
    }
}

/// How a run ended
#[derive(Debug)]
pub enum Ended {
    /// Every test ran, or an infrastructure error aborted the run
    Finished(Result<()>),
    /// A signal cut the run short
    Signalled { signal: Signal, cleaned: bool },
}

impl Ended {
    /// Process exit status for this ending
    pub fn exit_code(&self, report: &RunReport) -> i32 {
        match self {
            Ended::Finished(Ok(())) if report.all_passed() => 0,
            Ended::Finished(Ok(())) => EXIT_FAILED,
            Ended::Finished(Err(_)) => EXIT_FATAL,
            Ended::Signalled { .. } => EXIT_INTERRUPTED,
        }
    }
}

/// Run `tests` until they finish or `signal` resolves
///
/// After an interrupt with machines still tracked, `confirm` is asked
/// whether to clean them; termination signals always clean.
pub async fn run_interruptible<S, C, F>(
    orchestrator: &Orchestrator,
    env: &mut Environment,
    tests: &[TestDescriptor],
    report: &mut RunReport,
    signal: S,
    confirm: C,
) -> Ended
where
    S: Future<Output = Signal>,
    C: FnOnce(usize) -> F,
    F: Future<Output = bool>,
{
    let raced = tokio::select! {
        result = orchestrator.run(env, tests, report) => Ok(result),
        signal = signal => Err(signal),
    };

    let signal = match raced {
        Ok(Ok(())) => return Ended::Finished(Ok(())),
        Ok(Err(e)) => {
            error!("Run aborted: {}", e);
            report.fatal = Some(e.to_string());
            return Ended::Finished(Err(e));
        }
        Err(signal) => signal,
    };

    warn!("Received {}", signal);
    report.interrupted = true;

    let count = env.managed_count();
    let clean = if signal == Signal::Interrupt && count > 0 {
        confirm(count).await
    } else {
        true
    };

    if clean {
        let cleanup = env.clean_all().await;
        for failure in &cleanup.failures {
            warn!("Left behind after cleanup: {}", failure);
        }
    } else {
        warn!("Leaving {} machine(s) running for inspection", count);
    }
    Ended::Signalled {
        signal,
        cleaned: clean,
    }
}

/// Resolve once the process receives an interrupt or termination signal
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = interrupt.recv() => Ok(Signal::Interrupt),
        _ = terminate.recv() => Ok(Signal::Terminate),
        _ = hangup.recv() => Ok(Signal::Terminate),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<Signal> {
    tokio::signal::ctrl_c().await?;
    Ok(Signal::Interrupt)
}

/// Ask the operator whether to reclaim `count` machines; defaults to yes
pub async fn confirm_cleanup(count: usize) -> bool {
    let prompt = format!("Clean up {} managed machine(s)? [Y/n] ", count);
    tokio::task::spawn_blocking(move || {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{}", prompt);
        let _ = stderr.flush();

        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => parse_answer(None),
            Ok(_) => parse_answer(Some(&line)),
        }
    })
    .await
    .unwrap_or(true)
}

/// `None` is end of input
pub fn parse_answer(answer: Option<&str>) -> bool {
    match answer.map(|a| a.trim().to_ascii_lowercase()) {
        None => true,
        Some(a) => !matches!(a.as_str(), "n" | "no"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(None => true ; "eof")]
    #[test_case(Some("\n") => true ; "empty")]
    #[test_case(Some("y\n") => true ; "yes")]
    #[test_case(Some("Yes") => true ; "yes word")]
    #[test_case(Some("n\n") => false ; "no")]
    #[test_case(Some(" NO \n") => false ; "no word")]
    fn test_parse_answer(answer: Option<&str>) -> bool {
        parse_answer(answer)
    }
}
