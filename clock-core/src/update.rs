//! Firmware update pipeline: states, the closed failure taxonomy, and the
//! transfer engines shared by the push (local HTTP PUT) and pull (streamed
//! download) paths.
//!
//! Both paths write through the `FlashTarget` boundary and converge on the
//! same tail: finalize the partition (image validation), then flip the boot
//! target. Every exit other than success maps to exactly one failure code
//! with the originating driver error preserved.

use serde::Serialize;

/// Push transfers read the request body in fixed chunks of this size.
pub const PUSH_CHUNK_SIZE: usize = 2048;

/// Consecutive zero-length reads tolerated before a stalling peer aborts
/// the transfer.
pub const MAX_STALLED_READS: u32 = 10;

/// Closed set of update failure causes; `step()` is the ordinal reported in
/// the local endpoint's error body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFailureCode {
    MissingPartition,
    SessionBegin,
    OutOfMemory,
    FlashWrite,
    Receive,
    ImageValidation,
    BootPartition,
}

impl UpdateFailureCode {
    pub fn step(self) -> u8 {
        match self {
            Self::MissingPartition => 1,
            Self::SessionBegin => 2,
            Self::OutOfMemory => 3,
            Self::FlashWrite => 4,
            Self::Receive => 5,
            Self::ImageValidation => 6,
            Self::BootPartition => 7,
        }
    }
}

/// A classified failure plus the raw driver error code for diagnostics.
/// The two numeric spaces are never merged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct UpdateFailure {
    pub code: UpdateFailureCode,
    pub raw: i32,
}

impl UpdateFailure {
    pub const fn new(code: UpdateFailureCode, raw: i32) -> Self {
        Self { code, raw }
    }
}

impl core::fmt::Display for UpdateFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} (0x{:04x})", self.code, self.raw)
    }
}

/// Terminal, user-visible state of an update attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "failure")]
pub enum UpdateState {
    #[default]
    Idle,
    Updating,
    Success,
    Failure(UpdateFailure),
}

impl UpdateState {
    /// A new attempt may only start from an idle or terminal state.
    pub fn can_start(&self) -> bool {
        !matches!(self, Self::Updating)
    }
}

/// Flash-write session against the next OTA partition. The firmware
/// implementation wraps the platform OTA calls; tests substitute mocks.
pub trait FlashTarget {
    /// Open a session. `size` is the expected image size when known.
    fn begin(&mut self, size: Option<usize>) -> Result<(), UpdateFailure>;
    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateFailure>;
    /// Close the session and validate the written image.
    fn finalize(&mut self) -> Result<(), UpdateFailure>;
    /// Flip the boot target to the freshly written partition.
    fn set_boot(&mut self) -> Result<(), UpdateFailure>;
    /// Discard a session that will not be finalized.
    fn abort(&mut self);
}

/// Shared tail of both update paths.
pub fn complete_update<F: FlashTarget + ?Sized>(flash: &mut F) -> Result<(), UpdateFailure> {
    flash.finalize()?;
    flash.set_boot()?;
    Ok(())
}

/// Push path: drain `content_len` bytes from `recv` into flash in bounded
/// chunks. `recv` returns the bytes read, `Ok(0)` for a stalled peer, or the
/// raw transport error. Runs to completion or to exactly one classified
/// failure.
pub fn run_push_update<F>(
    flash: &mut F,
    content_len: usize,
    mut recv: impl FnMut(&mut [u8]) -> Result<usize, i32>,
) -> Result<(), UpdateFailure>
where
    F: FlashTarget + ?Sized,
{
    flash.begin(None)?;

    let mut buf = vec![0u8; PUSH_CHUNK_SIZE];
    let mut total = 0usize;
    let mut stalled = 0u32;
    while total < content_len {
        match recv(&mut buf) {
            Ok(0) => {
                stalled += 1;
                if stalled > MAX_STALLED_READS {
                    flash.abort();
                    return Err(UpdateFailure::new(UpdateFailureCode::Receive, 0));
                }
            }
            Ok(n) => {
                stalled = 0;
                total += n;
                if let Err(failure) = flash.write(&buf[..n]) {
                    flash.abort();
                    return Err(failure);
                }
            }
            Err(raw) => {
                flash.abort();
                return Err(UpdateFailure::new(UpdateFailureCode::Receive, raw));
            }
        }
    }

    complete_update(flash)
}

/// Progress of one bounded step of a streaming transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceProgress {
    Pending,
    Complete { all_received: bool },
}

/// One-bounded-step firmware download. The implementation writes whatever
/// arrived during the step straight to `flash` and maps transport errors to
/// `Receive` failures.
pub trait FirmwareSource {
    fn advance(&mut self, flash: &mut dyn FlashTarget) -> Result<SourceProgress, UpdateFailure>;
}

/// Pull path: a flash session fed one bounded step per control tick from a
/// streaming source.
pub struct PullUpdate<S, F> {
    source: S,
    flash: F,
    finished: bool,
}

impl<S: FirmwareSource, F: FlashTarget> PullUpdate<S, F> {
    /// Open the flash session; a begin failure is terminal before any byte
    /// moves.
    pub fn begin(source: S, mut flash: F) -> Result<Self, UpdateFailure> {
        flash.begin(None)?;
        Ok(Self {
            source,
            flash,
            finished: false,
        })
    }

    /// Advance by one bounded step. Returns `Some` exactly once, with the
    /// terminal outcome.
    pub fn step(&mut self) -> Option<Result<(), UpdateFailure>> {
        if self.finished {
            return None;
        }
        let outcome = match self.source.advance(&mut self.flash) {
            Ok(SourceProgress::Pending) => return None,
            Ok(SourceProgress::Complete { all_received: true }) => {
                complete_update(&mut self.flash)
            }
            Ok(SourceProgress::Complete {
                all_received: false,
            }) => {
                // Transfer ended short of the announced size: the image on
                // flash is truncated.
                self.flash.abort();
                Err(UpdateFailure::new(UpdateFailureCode::ImageValidation, 0))
            }
            Err(failure) => {
                self.flash.abort();
                Err(failure)
            }
        };
        self.finished = true;
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockFlash {
        begun: bool,
        written: Vec<u8>,
        finalized: bool,
        boot_set: bool,
        aborted: bool,
        fail_begin: Option<UpdateFailure>,
        fail_write: Option<UpdateFailure>,
        fail_finalize: Option<UpdateFailure>,
        fail_set_boot: Option<UpdateFailure>,
    }

    impl FlashTarget for MockFlash {
        fn begin(&mut self, _size: Option<usize>) -> Result<(), UpdateFailure> {
            if let Some(f) = self.fail_begin {
                return Err(f);
            }
            self.begun = true;
            Ok(())
        }

        fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateFailure> {
            if let Some(f) = self.fail_write {
                return Err(f);
            }
            self.written.extend_from_slice(chunk);
            Ok(())
        }

        fn finalize(&mut self) -> Result<(), UpdateFailure> {
            if let Some(f) = self.fail_finalize {
                return Err(f);
            }
            self.finalized = true;
            Ok(())
        }

        fn set_boot(&mut self) -> Result<(), UpdateFailure> {
            if let Some(f) = self.fail_set_boot {
                return Err(f);
            }
            self.boot_set = true;
            Ok(())
        }

        fn abort(&mut self) {
            self.aborted = true;
        }
    }

    /// Body reader delivering a fixed script of read results.
    fn scripted(
        script: Vec<Result<usize, i32>>,
    ) -> impl FnMut(&mut [u8]) -> Result<usize, i32> {
        let mut script = script.into_iter();
        move |buf: &mut [u8]| match script.next() {
            Some(Ok(n)) => {
                buf[..n].fill(0xab);
                Ok(n)
            }
            Some(Err(e)) => Err(e),
            None => Ok(0),
        }
    }

    #[test]
    fn push_happy_path_writes_everything_and_flips_boot() {
        let mut flash = MockFlash::default();
        let result = run_push_update(&mut flash, 5000, scripted(vec![Ok(2048), Ok(2048), Ok(904)]));
        assert!(result.is_ok());
        assert_eq!(flash.written.len(), 5000);
        assert!(flash.finalized);
        assert!(flash.boot_set);
        assert!(!flash.aborted);
    }

    #[test]
    fn push_tolerates_up_to_ten_stalled_reads() {
        let mut flash = MockFlash::default();
        let mut script = vec![Ok(1000)];
        script.extend(std::iter::repeat(Ok(0)).take(10));
        script.push(Ok(1000));
        let result = run_push_update(&mut flash, 2000, scripted(script));
        assert!(result.is_ok());
        assert_eq!(flash.written.len(), 2000);
    }

    #[test]
    fn push_stalling_peer_is_a_receive_failure() {
        // Content-Length promises more than the peer ever sends.
        let mut flash = MockFlash::default();
        let result = run_push_update(&mut flash, 10_000, scripted(vec![Ok(1000)]));
        assert_eq!(
            result,
            Err(UpdateFailure::new(UpdateFailureCode::Receive, 0))
        );
        assert!(flash.aborted);
        assert!(!flash.finalized);
        assert!(!flash.boot_set);
    }

    #[test]
    fn push_transport_error_preserves_raw_code() {
        let mut flash = MockFlash::default();
        let result = run_push_update(&mut flash, 4096, scripted(vec![Ok(1024), Err(-0x7001)]));
        assert_eq!(
            result,
            Err(UpdateFailure::new(UpdateFailureCode::Receive, -0x7001))
        );
        assert!(flash.aborted);
    }

    #[test]
    fn push_write_failure_aborts_with_flash_code() {
        let mut flash = MockFlash {
            fail_write: Some(UpdateFailure::new(UpdateFailureCode::FlashWrite, 0x105)),
            ..Default::default()
        };
        let result = run_push_update(&mut flash, 2048, scripted(vec![Ok(2048)]));
        assert_eq!(
            result,
            Err(UpdateFailure::new(UpdateFailureCode::FlashWrite, 0x105))
        );
        assert!(flash.aborted);
    }

    #[test]
    fn push_begin_failure_is_terminal() {
        let mut flash = MockFlash {
            fail_begin: Some(UpdateFailure::new(UpdateFailureCode::SessionBegin, 0x103)),
            ..Default::default()
        };
        let result = run_push_update(&mut flash, 100, scripted(vec![Ok(100)]));
        assert_eq!(
            result,
            Err(UpdateFailure::new(UpdateFailureCode::SessionBegin, 0x103))
        );
        assert!(flash.written.is_empty());
    }

    #[test]
    fn push_validation_failure_surfaces() {
        let mut flash = MockFlash {
            fail_finalize: Some(UpdateFailure::new(
                UpdateFailureCode::ImageValidation,
                0x1503,
            )),
            ..Default::default()
        };
        let result = run_push_update(&mut flash, 10, scripted(vec![Ok(10)]));
        assert_eq!(
            result,
            Err(UpdateFailure::new(UpdateFailureCode::ImageValidation, 0x1503))
        );
    }

    /// Streaming source delivering a fixed number of chunks, then complete.
    struct ScriptedSource {
        chunks: usize,
        delivered: usize,
        all_received: bool,
        fail_with: Option<UpdateFailure>,
    }

    impl FirmwareSource for ScriptedSource {
        fn advance(&mut self, flash: &mut dyn FlashTarget) -> Result<SourceProgress, UpdateFailure> {
            if let Some(f) = self.fail_with {
                return Err(f);
            }
            if self.delivered < self.chunks {
                flash.write(&[0xcd; 512])?;
                self.delivered += 1;
                Ok(SourceProgress::Pending)
            } else {
                Ok(SourceProgress::Complete {
                    all_received: self.all_received,
                })
            }
        }
    }

    #[test]
    fn pull_round_trip_succeeds_once() {
        let source = ScriptedSource {
            chunks: 4,
            delivered: 0,
            all_received: true,
            fail_with: None,
        };
        let mut pull = PullUpdate::begin(source, MockFlash::default()).unwrap();
        let mut outcome = None;
        for _ in 0..10 {
            if let Some(result) = pull.step() {
                outcome = Some(result);
                break;
            }
        }
        assert_eq!(outcome, Some(Ok(())));
        assert!(pull.flash.finalized);
        assert!(pull.flash.boot_set);
        assert_eq!(pull.flash.written.len(), 4 * 512);
        // Terminal: further steps report nothing, Updating is not revisited.
        assert!(pull.step().is_none());
    }

    #[test]
    fn pull_session_begin_failure_is_exactly_session_begin() {
        let source = ScriptedSource {
            chunks: 0,
            delivered: 0,
            all_received: true,
            fail_with: None,
        };
        let flash = MockFlash {
            fail_begin: Some(UpdateFailure::new(UpdateFailureCode::SessionBegin, 0x105)),
            ..Default::default()
        };
        let err = PullUpdate::begin(source, flash).err().unwrap();
        assert_eq!(err, UpdateFailure::new(UpdateFailureCode::SessionBegin, 0x105));
    }

    #[test]
    fn pull_truncated_transfer_fails_validation() {
        let source = ScriptedSource {
            chunks: 1,
            delivered: 0,
            all_received: false,
            fail_with: None,
        };
        let mut pull = PullUpdate::begin(source, MockFlash::default()).unwrap();
        assert!(pull.step().is_none());
        let outcome = pull.step().unwrap();
        assert_eq!(
            outcome,
            Err(UpdateFailure::new(UpdateFailureCode::ImageValidation, 0))
        );
        assert!(pull.flash.aborted);
    }

    #[test]
    fn pull_transport_failure_aborts() {
        let source = ScriptedSource {
            chunks: 0,
            delivered: 0,
            all_received: true,
            fail_with: Some(UpdateFailure::new(UpdateFailureCode::Receive, 0x7002)),
        };
        let mut pull = PullUpdate::begin(source, MockFlash::default()).unwrap();
        let outcome = pull.step().unwrap();
        assert_eq!(
            outcome,
            Err(UpdateFailure::new(UpdateFailureCode::Receive, 0x7002))
        );
        assert!(pull.flash.aborted);
    }

    #[test]
    fn update_state_gating() {
        assert!(UpdateState::Idle.can_start());
        assert!(UpdateState::Success.can_start());
        assert!(UpdateState::Failure(UpdateFailure::new(UpdateFailureCode::Receive, 0)).can_start());
        assert!(!UpdateState::Updating.can_start());
    }
}
