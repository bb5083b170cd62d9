//! In-process stand-in for worker processes, for supervisor and master tests.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::launcher::{WorkerEvent, WorkerLauncher, WorkerLink};
use crate::config::ClusterOptions;
use crate::types::{ClusterError, Result, WorkerSlot};

/// What the fake workers were asked to do, shared with the test
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    launched: Arc<Mutex<Vec<(WorkerSlot, u32)>>>,
    delivered: Arc<Mutex<Vec<(WorkerSlot, u32, SocketAddr)>>>,
    terminated: Arc<Mutex<Vec<u32>>>,
    links: Arc<Mutex<Vec<(WorkerSlot, u32, mpsc::UnboundedSender<WorkerEvent>)>>>,
}

impl Recorder {
    pub(crate) fn launched(&self) -> Vec<(WorkerSlot, u32)> {
        self.launched.lock().unwrap().clone()
    }

    pub(crate) fn delivered(&self) -> Vec<(WorkerSlot, u32, SocketAddr)> {
        self.delivered.lock().unwrap().clone()
    }

    pub(crate) fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().clone()
    }

    /// Report that worker `pid` exited on its own, as its monitor would.
    pub(crate) fn report_exit(&self, pid: u32) {
        let links = self.links.lock().unwrap();
        if let Some((slot, _, events)) = links.iter().find(|(_, known, _)| *known == pid) {
            let _ = events.send(WorkerEvent::Exited {
                slot: *slot,
                pid,
                code: Some(0),
                signal: None,
            });
        }
    }
}

pub(crate) struct FakeLauncher {
    recorder: Recorder,
    next_pid: u32,
    /// Exit as soon as terminated (like a real worker) or ignore SIGTERM
    cooperative: bool,
    /// Launches fail once this many workers have been started
    fail_after: Option<usize>,
}

impl FakeLauncher {
    pub(crate) fn cooperative(recorder: Recorder) -> Self {
        Self {
            recorder,
            next_pid: 1000,
            cooperative: true,
            fail_after: None,
        }
    }

    pub(crate) fn stubborn(recorder: Recorder) -> Self {
        Self {
            cooperative: false,
            ..Self::cooperative(recorder)
        }
    }

    pub(crate) fn failing_after(mut self, launches: usize) -> Self {
        self.fail_after = Some(launches);
        self
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(
        &mut self,
        slot: WorkerSlot,
        _options: &ClusterOptions,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerLink>> {
        let launched = self.recorder.launched.lock().unwrap().len();
        if self.fail_after.is_some_and(|limit| launched >= limit) {
            return Err(ClusterError::Spawn {
                slot,
                source: io::Error::new(io::ErrorKind::Other, "fake launch failure"),
            });
        }

        self.next_pid += 1;
        let pid = self.next_pid;
        self.recorder.launched.lock().unwrap().push((slot, pid));
        self.recorder.links.lock().unwrap().push((slot, pid, events.clone()));

        Ok(Box::new(FakeLink {
            slot,
            pid,
            cooperative: self.cooperative,
            recorder: self.recorder.clone(),
            events,
        }))
    }
}

struct FakeLink {
    slot: WorkerSlot,
    pid: u32,
    cooperative: bool,
    recorder: Recorder,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerLink for FakeLink {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn deliver(&self, slot: WorkerSlot, peer: SocketAddr, _connection: &TcpStream) -> io::Result<()> {
        self.recorder.delivered.lock().unwrap().push((slot, self.pid, peer));
        Ok(())
    }

    fn terminate(&self) -> io::Result<()> {
        self.recorder.terminated.lock().unwrap().push(self.pid);
        if self.cooperative {
            let _ = self.events.send(WorkerEvent::Exited {
                slot: self.slot,
                pid: self.pid,
                code: None,
                signal: Some(libc::SIGTERM),
            });
        }
        Ok(())
    }
}
