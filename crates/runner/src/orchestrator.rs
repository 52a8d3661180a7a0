//! Test orchestration
//!
//! Tests run strictly one after another. Each goes through
//! `Pending -> Building -> Running -> TornDown`; a machine that was built
//! is torn down exactly once whatever the script did, and the whole
//! environment is cleaned once all tests are done or the run aborts.

use sightline_common::config::{DisplayConfig, RecordingConfig};
use sightline_common::{Endpoint, Error, ErrorClass, Outcome, Result, RunLogs, TestLog};
use sightline_screen::{ImageCatalog, NccMatcher, Session, SessionSettings, VncDoChannel};
use sightline_vm::{Environment, ManagedMachine};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

use crate::descriptor::TestDescriptor;
use crate::report::{RunReport, TestRecord};
use crate::script::ScriptContext;

/// Lifecycle state of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Building,
    Running,
    TornDown,
}

impl Phase {
    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        let allowed = matches!(
            (*self, next),
            (Phase::Pending, Phase::Building)
                | (Phase::Building, Phase::Running)
                | (Phase::Building, Phase::TornDown)
                | (Phase::Running, Phase::TornDown)
        );
        if !allowed {
            return Err(Error::usage(format!(
                "test cannot go from {:?} to {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Binds a screen automation session to a machine's display
pub trait SessionFactory: Send + Sync {
    fn open(&self, endpoint: &Endpoint, catalog: ImageCatalog) -> Session;
}

/// Sessions driving the display through `vncdo`
pub struct VncSessionFactory {
    display: DisplayConfig,
    recording: RecordingConfig,
}

impl VncSessionFactory {
    pub fn new(display: DisplayConfig, recording: RecordingConfig) -> Self {
        Self { display, recording }
    }
}

impl SessionFactory for VncSessionFactory {
    fn open(&self, endpoint: &Endpoint, catalog: ImageCatalog) -> Session {
        let password = Some(self.display.password.clone()).filter(|p| !p.is_empty());
        let channel = VncDoChannel::new(self.display.vncdo.clone(), endpoint, password);
        let matcher = NccMatcher::new()
            .with_min_screen(self.display.min_screen_width, self.display.min_screen_height);
        Session::new(
            Box::new(channel),
            Box::new(matcher),
            catalog,
            SessionSettings::from_config(&self.display, &self.recording),
        )
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub uri: String,
    pub pool_path: PathBuf,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    factory: Box<dyn SessionFactory>,
    logs: RunLogs,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, factory: Box<dyn SessionFactory>, logs: RunLogs) -> Self {
        Self {
            settings,
            factory,
            logs,
        }
    }

    /// Run `tests` in order, recording each result in `report`
    ///
    /// An `Err` is an infrastructure failure that aborted the run; the
    /// environment has been cleaned before it is returned.
    pub async fn run(
        &self,
        env: &mut Environment,
        tests: &[TestDescriptor],
        report: &mut RunReport,
    ) -> Result<()> {
        let result = self.run_all(env, tests, report).await;

        let cleanup = env.clean_all().await;
        for failure in &cleanup.failures {
            warn!("Left behind after cleanup: {}", failure);
        }
        if !cleanup.is_noop() {
            info!(
                "Cleanup reclaimed {} machine(s){}",
                cleanup.machines,
                if cleanup.pool_destroyed { " and the storage pool" } else { "" }
            );
        }

        result
    }

    async fn run_all(
        &self,
        env: &mut Environment,
        tests: &[TestDescriptor],
        report: &mut RunReport,
    ) -> Result<()> {
        env.connect(&self.settings.uri).await?;
        env.ensure_pool(&self.settings.pool_path).await?;

        for (i, test) in tests.iter().enumerate() {
            let record = self.run_test(env, i + 1, test).await?;
            info!("{}: {} ({})", record.name, record.outcome, record.message);
            report.push(record);
        }
        Ok(())
    }

    /// Build, exercise and tear down one test
    pub async fn run_test(
        &self,
        env: &mut Environment,
        index: usize,
        test: &TestDescriptor,
    ) -> Result<TestRecord> {
        let started = Instant::now();
        let mut log = self.logs.open_test(index, &test.name)?;
        log.info(format!("Starting test {}", test.name));

        let mut phase = Phase::Pending;
        phase.advance(Phase::Building)?;

        let machine = match env
            .build(&test.machine_template, &test.storage_template, &test.boot_medium)
            .await
        {
            Ok(machine) => machine,
            Err(e) if e.is_infrastructure() => {
                log.error(format!("Building the machine failed: {}", e));
                return Err(e);
            }
            Err(e) => {
                let message = format!("Building the machine failed: {}", e);
                log.error(&message);
                return Ok(record(test, Outcome::Errored, message, started, &log));
            }
        };
        log.info(format!(
            "Machine {} built, display at {}",
            machine.domain(),
            machine.endpoint()
        ));

        let result = self.exercise(&mut phase, &machine, index, test, &mut log).await;

        phase.advance(Phase::TornDown)?;
        let domain = machine.domain().to_string();
        if let Err(e) = env.tear_down(machine).await {
            log.error(format!("Tearing down {} failed: {}", domain, e));
            return Err(e);
        }
        log.info(format!("Machine {} torn down", domain));

        let (outcome, message) = result?;
        match outcome {
            Outcome::Passed => log.info(format!("PASSED: {}", message)),
            Outcome::Failed => log.error(format!("FAILED: {}", message)),
            Outcome::Errored => log.error(format!("ERROR: {}", message)),
        }
        Ok(record(test, outcome, message, started, &log))
    }

    /// Everything between building and tearing down the machine
    async fn exercise(
        &self,
        phase: &mut Phase,
        machine: &ManagedMachine,
        index: usize,
        test: &TestDescriptor,
        log: &mut TestLog,
    ) -> Result<(Outcome, String)> {
        let catalog = match ImageCatalog::load(&test.images) {
            Ok(catalog) => catalog,
            Err(e) => {
                let message = format!("Cannot load images from {}: {}", test.images.display(), e);
                return Ok((Outcome::Errored, message));
            }
        };
        log.info(format!("Loaded {} reference image(s)", catalog.len()));

        let mut session = self.factory.open(machine.endpoint(), catalog);
        if test.record {
            let video = self.logs.artifact(index, &test.name, ".ogv");
            if session.set_recording(&video).await {
                log.info(format!("Recording to {}", video.display()));
            } else {
                log.warn("Recording could not start; continuing without video");
            }
        }

        let booted = match self.boot(&mut session, test, log).await {
            Ok(None) => phase.advance(Phase::Running).map(|()| None),
            other => other,
        };
        let verdict = match booted {
            Ok(Some(verdict)) => verdict,
            Ok(None) => {
                let mut ctx = ScriptContext::new(&mut session, log, &self.logs, index, &test.name);
                match test.script.run(&mut ctx).await {
                    Ok(value) => value.verdict(),
                    Err(e) => classify(e),
                }
            }
            Err(e) => {
                close(&mut session, log).await;
                return Err(e);
            }
        };

        if verdict.0 != Outcome::Passed {
            let path = self.logs.artifact(index, &test.name, "-final.png");
            match session.log_screen(&path).await {
                Ok(()) => log.info(format!("Final screen saved to {}", path.display())),
                Err(e) => log.warn(format!("Cannot save the final screen: {}", e)),
            }
        }
        close(&mut session, log).await;
        Ok(verdict)
    }

    /// Wait for the test's first screen, if it declares one
    ///
    /// `Some` carries the verdict of a test that never got to its script.
    async fn boot(
        &self,
        session: &mut Session,
        test: &TestDescriptor,
        log: &mut TestLog,
    ) -> Result<Option<(Outcome, String)>> {
        let Some(first) = &test.first_screen else {
            return Ok(None);
        };

        log.info(format!("Waiting up to {:?} for {}", test.boot_timeout, first));
        match session.wait(first.clone(), Some(test.boot_timeout)).await {
            Ok(()) => {
                log.info("System booted");
                Ok(None)
            }
            Err(e) if e.is_infrastructure() => Err(e),
            Err(e) => Ok(Some(classify(e))),
        }
    }
}

/// Finalize the session's recording, whatever ended the test
async fn close(session: &mut Session, log: &mut TestLog) {
    if let Err(e) = session.finish().await {
        log.warn(format!("Closing the recording failed: {}", e));
    }
}

/// Outcome of a script that raised `e`
fn classify(e: Error) -> (Outcome, String) {
    match e.class() {
        ErrorClass::ImageNotFound | ErrorClass::TestFailure => (Outcome::Failed, e.to_string()),
        ErrorClass::Infrastructure | ErrorClass::TestLogic | ErrorClass::Usage => {
            (Outcome::Errored, e.to_string())
        }
    }
}

fn record(test: &TestDescriptor, outcome: Outcome, message: String, started: Instant, log: &TestLog) -> TestRecord {
    TestRecord {
        name: test.name.clone(),
        outcome,
        message,
        duration_ms: started.elapsed().as_millis() as u64,
        log_file: Some(log.path().to_path_buf()),
    }
}
