//! The two-stage migration from a factory NAND layout to the final one.
//!
//! Stage1 runs under the factory firmware: it installs the new bootloader and a kernel, plus a
//! payload for Stage2, and tells the bootloader where to find them. Stage2 runs under that new
//! kernel: it populates the recovery partition, re-creates the device identity in the miner
//! configuration, and finally erases everything the factory firmware left behind.
//!
//! Each stage is a linear sequence of steps. The first failing step aborts the stage; nothing is
//! retried or rolled back, and the error says which state was last reached. Stage2 may be run
//! again after a failure: it skips whatever the miner configuration shows is already done.

pub mod identity;
pub mod metadata;
pub mod payload;
pub mod stage1;
pub mod stage2;

#[cfg(test)]
mod tests;

use std::fmt;

use thiserror::Error;
use tracing::{error, info};

use crate::error::MigrateError;

pub use identity::Identity;
pub use metadata::MigrationMetadata;
pub use payload::Stage2Payload;
pub use stage1::{Stage1, Stage1Report};
pub use stage2::{Stage2, Stage2Report};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage {
    Stage1,
    Stage2,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Stage1 => write!(f, "stage1"),
            Stage::Stage2 => write!(f, "stage2"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage1State {
    Start,
    VariantResolved,
    BootloaderWritten,
    EnvironmentErased,
    EnvironmentWritten,
    PayloadWritten,
    MetadataPublished,
    Done,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage2State {
    Start,
    IdentityRead,
    PayloadUnpacked,
    RecoveryWritten,
    MinerConfigWritten,
    LegacyErased,
    Done,
}

/// The last state a stage reached
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Checkpoint {
    Stage1(Stage1State),
    Stage2(Stage2State),
}

impl From<Stage1State> for Checkpoint {
    fn from(state: Stage1State) -> Self {
        Checkpoint::Stage1(state)
    }
}

impl From<Stage2State> for Checkpoint {
    fn from(state: Stage2State) -> Self {
        Checkpoint::Stage2(state)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Stage1(state) => write!(f, "{state:?}"),
            Checkpoint::Stage2(state) => write!(f, "{state:?}"),
        }
    }
}

#[derive(Error, Debug)]
#[error("{stage} aborted at step \"{step}\" (last completed state: {completed})")]
pub struct StageError {
    pub stage: Stage,
    pub step: &'static str,
    pub completed: Checkpoint,
    #[source]
    pub source: MigrateError,
}

impl StageError {
    pub fn exit_code(&self) -> u8 {
        self.source.exit_code()
    }
}

/// Drives one stage through its states, reporting progress as it goes
struct Runner<S> {
    stage: Stage,
    state: S,
    rpt: howudoin::Tx,
}

impl<S: Copy + fmt::Debug + Into<Checkpoint>> Runner<S> {
    fn new(stage: Stage, start: S, steps: usize) -> Self {
        let rpt = howudoin::new()
            .label(format!("Migrating NAND ({stage})"))
            .set_len(u64::try_from(steps).ok());

        Self {
            stage,
            state: start,
            rpt,
        }
    }

    /// Run one step, advancing to `next` if it succeeds
    fn step<T>(
        &mut self,
        desc: &'static str,
        next: S,
        f: impl FnOnce(&howudoin::Tx) -> Result<T, MigrateError>,
    ) -> Result<T, StageError> {
        info!("{}: {desc}", self.stage);
        self.rpt.desc(desc);

        match f(&self.rpt) {
            Ok(value) => {
                self.state = next;
                self.rpt.inc();
                Ok(value)
            }
            Err(source) => {
                error!("{}: {desc} failed: {source}", self.stage);
                if source.is_flash_failure() {
                    error!("NAND contents past {:?} are indeterminate", self.state);
                }
                Err(StageError {
                    stage: self.stage,
                    step: desc,
                    completed: self.state.into(),
                    source,
                })
            }
        }
    }

    /// Record a step an earlier run already completed
    fn skip(&mut self, desc: &'static str, next: S) {
        info!("{}: {desc}: already done", self.stage);
        self.state = next;
        self.rpt.inc();
    }

    fn finish(self) -> S {
        self.rpt.finish();
        info!("{}: reached {:?}", self.stage, self.state);
        self.state
    }
}

#[test]
fn test_stage_error_display() {
    let err = StageError {
        stage: Stage::Stage1,
        step: "Writing bootloader",
        completed: Stage1State::VariantResolved.into(),
        source: MigrateError::FlashVerifyFailed {
            device: 0,
            offset: 0,
        },
    };

    assert_eq!(
        err.to_string(),
        "stage1 aborted at step \"Writing bootloader\" (last completed state: VariantResolved)"
    );
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn test_runner_tracks_state() {
    let mut runner = Runner::new(Stage::Stage2, Stage2State::Start, 2);

    assert_eq!(
        runner
            .step("one", Stage2State::IdentityRead, |_| Ok(1))
            .unwrap(),
        1
    );

    let err = runner
        .step("two", Stage2State::PayloadUnpacked, |_| -> Result<(), _> {
            Err(MigrateError::Payload("nope".into()))
        })
        .unwrap_err();
    assert_eq!(err.completed, Checkpoint::Stage2(Stage2State::IdentityRead));
    assert_eq!(err.step, "two");
    assert_eq!(runner.finish(), Stage2State::IdentityRead);
}

#[test]
fn test_runner_skip() {
    let mut runner = Runner::new(Stage::Stage2, Stage2State::Start, 3);
    runner.skip("one", Stage2State::IdentityRead);
    runner.skip("two", Stage2State::PayloadUnpacked);

    let err = runner
        .step("three", Stage2State::RecoveryWritten, |_| -> Result<(), _> {
            Err(MigrateError::Payload("nope".into()))
        })
        .unwrap_err();
    assert_eq!(err.completed, Checkpoint::Stage2(Stage2State::PayloadUnpacked));
}
