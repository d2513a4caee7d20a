//! The event loop driving the per-buffer ownership handoff.
//!
//! Single-threaded: the only blocking call is the multiplexed wait over the
//! shutdown source, the capture fds and the display fd. The coordinator is
//! the sole mutator of slot state; the capture and display backends only
//! report events or accept commands.

use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pipeline::slots::SlotTable;
use crate::pipeline::{FrameSource, ScanoutSink};

/// Event-loop tuning, passed in at setup rather than compiled in.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Buffers per stream pool.
    pub buffer_count: u32,
    /// Pool index held back from the capture queue for the first scanout.
    pub reserved_index: Option<u32>,
    /// Bound on the blocking wait; expiry means the pipeline stalled.
    pub poll_timeout_ms: u16,
    /// Consecutive hard retrieve errors before the loop gives up.
    pub max_consecutive_errors: u32,
}

struct Lane<S> {
    source: S,
    slots: SlotTable,
}

/// Multiplexes capture completion, display completion and shutdown, and
/// drives every [`SlotTable`] transition.
pub struct Coordinator<S, K> {
    lanes: Vec<Lane<S>>,
    sink: K,
    poll_timeout: PollTimeout,
    max_consecutive_errors: u32,
    hard_errors: u32,
    completions: u64,
    shut_down: bool,
}

impl<S: FrameSource, K: ScanoutSink> Coordinator<S, K> {
    pub fn new(sources: Vec<S>, sink: K, config: CoordinatorConfig) -> Self {
        let lanes = sources
            .into_iter()
            .map(|source| Lane {
                source,
                slots: SlotTable::new(config.buffer_count, config.reserved_index),
            })
            .collect();
        Self {
            lanes,
            sink,
            poll_timeout: PollTimeout::from(config.poll_timeout_ms),
            max_consecutive_errors: config.max_consecutive_errors,
            hard_errors: 0,
            completions: 0,
            shut_down: false,
        }
    }

    /// Capture readiness on stream `stream`: claim the completed buffer,
    /// bind it to the stream's plane, and hand the displaced buffer back to
    /// the capture queue. A "not ready" retrieve is silently skipped; a
    /// hard error is logged and confined to this cycle.
    pub fn handle_capture_ready(&mut self, stream: usize) -> Result<()> {
        let lane = &mut self.lanes[stream];

        let index = match lane.source.retrieve() {
            Ok(Some(index)) => index,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.hard_errors += 1;
                warn!(
                    "stream {stream}: dequeue failed{}: {e}",
                    e.os_code().map(|c| format!(" (errno {c})")).unwrap_or_default()
                );
                return Ok(());
            }
        };
        self.hard_errors = 0;

        lane.slots.captured(index)?;

        match self.sink.present(stream, index) {
            Ok(()) => {
                // Ownership handoff: the new buffer goes on screen, the one
                // it displaced goes back to the capture driver.
                let displaced = lane.slots.displayed(index)?;
                if let Some(prev) = displaced {
                    match lane.source.submit(prev) {
                        Ok(()) => lane.slots.requeued(prev)?,
                        Err(e) => warn!("stream {stream}: resubmit of {prev} failed: {e}"),
                    }
                }
            }
            Err(e) => {
                warn!(
                    "stream {stream}: scanout bind of buffer {index} failed{}: {e}",
                    e.os_code().map(|c| format!(" (errno {c})")).unwrap_or_default()
                );
                // The next completed frame retries; this one goes straight
                // back to the capture queue so it is not stranded.
                match lane.source.submit(index) {
                    Ok(()) => lane.slots.requeued(index)?,
                    Err(e) => warn!("stream {stream}: resubmit of {index} failed: {e}"),
                }
            }
        }
        Ok(())
    }

    /// Display readiness: drain completion events. Completion means the
    /// scanout engine is done reading a buffer, which is what licenses a
    /// later resubmission to the capture side.
    pub fn handle_display_ready(&mut self) {
        match self.sink.completions() {
            Ok(n) => {
                self.completions += u64::from(n);
                if n > 0 {
                    debug!("{n} scanout completion(s), total {}", self.completions);
                }
            }
            Err(e) => warn!("display event read failed: {e}"),
        }
    }

    /// Stop every stream, then restore the display, exactly once. Safe to
    /// call again; later calls are no-ops.
    pub fn teardown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for (i, lane) in self.lanes.iter_mut().enumerate() {
            if let Err(e) = lane.source.stop() {
                warn!("stream {i}: stop failed: {e}");
            }
        }
        if let Err(e) = self.sink.restore() {
            warn!("display restore failed: {e}");
        }
    }

    pub fn displayed_index(&self, stream: usize) -> Option<u32> {
        self.lanes[stream].slots.displayed_index()
    }

    pub fn completions(&self) -> u64 {
        self.completions
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.hard_errors
    }

    #[cfg(test)]
    fn slots(&self, stream: usize) -> &SlotTable {
        &self.lanes[stream].slots
    }

    #[cfg(test)]
    fn sink(&self) -> &K {
        &self.sink
    }

    #[cfg(test)]
    fn source(&self, stream: usize) -> &S {
        &self.lanes[stream].source
    }
}

impl<S, K> Coordinator<S, K>
where
    S: FrameSource + AsFd,
    K: ScanoutSink + AsFd,
{
    /// Run until the shutdown source signals, the wait times out (stall),
    /// or hard errors exceed their budget. Always tears down before
    /// returning.
    pub fn run<F: AsFd>(&mut self, shutdown: &F) -> Result<()> {
        info!("pipeline running on {} stream(s)", self.lanes.len());

        loop {
            if self.hard_errors >= self.max_consecutive_errors {
                warn!(
                    "{} consecutive hard errors, terminating pipeline",
                    self.hard_errors
                );
                break;
            }

            let readable = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
            let mut fds = Vec::with_capacity(2 + self.lanes.len());
            fds.push(PollFd::new(shutdown.as_fd(), PollFlags::POLLIN));
            fds.push(PollFd::new(self.sink.as_fd(), PollFlags::POLLIN));
            for lane in &self.lanes {
                fds.push(PollFd::new(lane.source.as_fd(), PollFlags::POLLIN));
            }

            match poll(&mut fds, self.poll_timeout) {
                Ok(0) => {
                    warn!("no event source became ready in time, treating as stall");
                    break;
                }
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.teardown();
                    return Err(e.into());
                }
            }

            let shutdown_requested = fds[0].revents().is_some_and(|r| r.intersects(readable));
            let display_ready = fds[1].revents().is_some_and(|r| r.intersects(readable));
            let capture_ready: Vec<bool> = fds[2..]
                .iter()
                .map(|fd| fd.revents().is_some_and(|r| r.intersects(readable)))
                .collect();
            drop(fds);

            if shutdown_requested {
                info!("user requested exit");
                break;
            }
            if display_ready {
                self.handle_display_ready();
            }
            for (stream, ready) in capture_ready.into_iter().enumerate() {
                if ready {
                    if let Err(e) = self.handle_capture_ready(stream) {
                        self.teardown();
                        return Err(e);
                    }
                }
            }
        }

        self.teardown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::error::Error;
    use crate::pipeline::slots::SlotState;

    /// Capture driver model: `queued` buffers are owned by the (fake)
    /// hardware and may be written; `completed` are captured and waiting.
    struct FakeSource {
        queued: VecDeque<u32>,
        completed: VecDeque<u32>,
        submitted: Vec<u32>,
        stop_calls: u32,
        fail_retrieve: bool,
    }

    impl FakeSource {
        /// Pool of `count` buffers with `reserved` held back, the state
        /// `CaptureStream::start` leaves the real driver in.
        fn started(count: u32, reserved: Option<u32>) -> Self {
            let queued = (0..count).filter(|i| Some(*i) != reserved).collect();
            Self {
                queued,
                completed: VecDeque::new(),
                submitted: Vec::new(),
                stop_calls: 0,
                fail_retrieve: false,
            }
        }

        /// Hardware finishes capturing the oldest queued buffer.
        fn complete_one(&mut self) -> Option<u32> {
            let idx = self.queued.pop_front()?;
            self.completed.push_back(idx);
            Some(idx)
        }
    }

    impl FrameSource for FakeSource {
        fn retrieve(&mut self) -> Result<Option<u32>> {
            if self.fail_retrieve {
                return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EIO)));
            }
            Ok(self.completed.pop_front())
        }

        fn submit(&mut self, index: u32) -> Result<()> {
            self.submitted.push(index);
            self.queued.push_back(index);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.stop_calls += 1;
            Ok(())
        }
    }

    struct FakeSink {
        on_screen: Vec<Option<u32>>,
        presents: Vec<(usize, u32)>,
        restore_calls: u32,
        fail_present: bool,
    }

    impl FakeSink {
        fn new(streams: usize) -> Self {
            Self {
                on_screen: vec![None; streams],
                presents: Vec::new(),
                restore_calls: 0,
                fail_present: false,
            }
        }
    }

    impl ScanoutSink for FakeSink {
        fn present(&mut self, stream: usize, index: u32) -> Result<()> {
            if self.fail_present {
                return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EINVAL)));
            }
            self.on_screen[stream] = Some(index);
            self.presents.push((stream, index));
            Ok(())
        }

        fn completions(&mut self) -> Result<u32> {
            Ok(0)
        }

        fn restore(&mut self) -> Result<()> {
            self.restore_calls += 1;
            Ok(())
        }
    }

    fn config(buffer_count: u32) -> CoordinatorConfig {
        CoordinatorConfig {
            buffer_count,
            reserved_index: Some(0),
            poll_timeout_ms: 3000,
            max_consecutive_errors: 30,
        }
    }

    fn coordinator(
        streams: usize,
        buffer_count: u32,
    ) -> Coordinator<FakeSource, FakeSink> {
        let sources = (0..streams)
            .map(|_| FakeSource::started(buffer_count, Some(0)))
            .collect();
        Coordinator::new(sources, FakeSink::new(streams), config(buffer_count))
    }

    #[test]
    fn single_camera_end_to_end() {
        // 1920x1080 UYVY, 4 buffers, captures complete at 1, 2, 3.
        let mut coord = coordinator(1, 4);
        for _ in 0..3 {
            coord.lanes[0].source.complete_one().unwrap();
            coord.handle_capture_ready(0).unwrap();
        }

        let sink = coord.sink();
        assert_eq!(sink.presents, vec![(0, 1), (0, 2), (0, 3)]);
        // Each bind was followed by exactly one resubmission of the buffer
        // that had been on screen before it.
        assert_eq!(coord.source(0).submitted, vec![0, 1, 2]);
        assert_eq!(coord.displayed_index(0), Some(3));
    }

    #[test]
    fn not_ready_retrieve_is_silent() {
        let mut coord = coordinator(1, 4);
        // Readiness without a completed buffer: nothing presented, no error.
        coord.handle_capture_ready(0).unwrap();
        assert!(coord.sink().presents.is_empty());
        assert_eq!(coord.consecutive_errors(), 0);
    }

    #[test]
    fn round_trip_preserves_index() {
        // A buffer submitted under an index is retrieved under that index.
        let mut source = FakeSource::started(1, Some(0));
        assert_eq!(source.retrieve().unwrap(), None);
        source.submit(0).unwrap();
        assert_eq!(source.complete_one(), Some(0));
        assert_eq!(source.retrieve().unwrap(), Some(0));
    }

    #[test]
    fn dual_camera_streams_stay_isolated() {
        let mut coord = coordinator(2, 4);
        for _ in 0..3 {
            coord.lanes[0].source.complete_one().unwrap();
            coord.handle_capture_ready(0).unwrap();
        }

        // Every bind targeted stream 0's plane; stream 1 untouched.
        assert!(coord.sink().presents.iter().all(|(s, _)| *s == 0));
        assert_eq!(coord.sink().on_screen[1], None);
        assert_eq!(coord.displayed_index(1), Some(0));
        assert!(coord.source(1).submitted.is_empty());
    }

    #[test]
    fn shutdown_stops_streams_then_restores_once() {
        let mut coord = coordinator(2, 4);
        coord.teardown();
        assert_eq!(coord.source(0).stop_calls, 1);
        assert_eq!(coord.source(1).stop_calls, 1);
        assert_eq!(coord.sink().restore_calls, 1);

        // Idempotent under partial-initialization rollback paths.
        coord.teardown();
        assert_eq!(coord.source(0).stop_calls, 1);
        assert_eq!(coord.sink().restore_calls, 1);
    }

    #[test]
    fn failed_bind_returns_buffer_to_capture() {
        let mut coord = coordinator(1, 4);
        coord.sink.fail_present = true;
        coord.lanes[0].source.complete_one().unwrap();
        coord.handle_capture_ready(0).unwrap();

        // The claimed buffer went straight back to the queue, the reserved
        // buffer stayed on screen, and the loop is free to continue.
        assert_eq!(coord.displayed_index(0), Some(0));
        assert_eq!(coord.source(0).submitted, vec![1]);
        assert_eq!(coord.slots(0).state(1), Some(SlotState::Capturing));
    }

    #[test]
    fn hard_errors_accumulate_until_success() {
        let mut coord = coordinator(1, 4);
        coord.lanes[0].source.fail_retrieve = true;
        for _ in 0..5 {
            coord.handle_capture_ready(0).unwrap();
        }
        assert_eq!(coord.consecutive_errors(), 5);

        coord.lanes[0].source.fail_retrieve = false;
        coord.lanes[0].source.complete_one().unwrap();
        coord.handle_capture_ready(0).unwrap();
        assert_eq!(coord.consecutive_errors(), 0);
    }

    /// The core safety property under randomized event interleavings: a
    /// buffer on screen is never simultaneously owned by the capture
    /// driver, across every observable step.
    #[test]
    fn displayed_never_overlaps_capturing_under_random_interleaving() {
        for seed in 0..16u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let streams = 1 + (seed as usize % 2);
            let mut coord = coordinator(streams, 4);

            for _ in 0..500 {
                let stream = rng.gen_range(0..streams);
                if rng.gen_bool(0.5) {
                    coord.lanes[stream].source.complete_one();
                }
                if rng.gen_bool(0.7) {
                    coord.handle_capture_ready(stream).unwrap();
                }

                for s in 0..streams {
                    coord.slots(s).check_invariants();
                    if let Some(on_screen) = coord.sink().on_screen[s] {
                        assert!(
                            !coord.source(s).queued.contains(&on_screen),
                            "seed {seed}: buffer {on_screen} is on screen and queued for capture"
                        );
                        assert_eq!(
                            coord.slots(s).state(on_screen),
                            Some(SlotState::Displayed)
                        );
                    }
                }
            }
        }
    }
}
