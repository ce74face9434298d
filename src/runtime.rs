//! Runtime construction: a `Builder` validated into a `Config`, which
//! boots one reactor per shard. Shard 0 runs on the calling thread; the
//! rest get pinned worker threads. The contract is that after `try_build`
//! succeeds, `block_on` and cross-shard submission work.

use crate::error::Fault;
use crate::future::Future;
use crate::reactor::Reactor;
use crate::smp::SmpContext;
use anyhow::{anyhow, Result};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

/// Default task-quota slice: how long the reactor drains ready tasks
/// before giving pollers a turn.
const DEFAULT_TASK_QUOTA: Duration = Duration::from_micros(500);

#[derive(Debug)]
pub struct Builder {
    shards: usize,
    cpuset: Option<Vec<usize>>,
    task_quota: Duration,
    poll_mode: bool,
    max_io_requests: Option<usize>,
    num_io_queues: Option<usize>,
    strict_dma: bool,
    thread_name: String,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            shards: 1,
            cpuset: None,
            task_quota: DEFAULT_TASK_QUOTA,
            poll_mode: false,
            max_io_requests: None,
            num_io_queues: None,
            strict_dma: true,
            thread_name: "shoal-shard".to_string(),
        }
    }

    /// Number of reactors, one per pinned CPU. Defaults to 1; use
    /// `available_parallelism` to take the whole machine.
    pub fn shards(mut self, val: usize) -> Self {
        assert!(val > 0, "shard count cannot be 0");
        self.shards = val;
        self
    }

    /// Explicit CPU ids to pin shards to, in shard order.
    pub fn cpuset(mut self, cpus: Vec<usize>) -> Self {
        self.cpuset = Some(cpus);
        self
    }

    pub fn task_quota(mut self, val: Duration) -> Self {
        self.task_quota = val;
        self
    }

    /// Busy-poll instead of sleeping when idle.
    pub fn poll_mode(mut self, val: bool) -> Self {
        self.poll_mode = val;
        self
    }

    /// Disk concurrency per I/O queue, normally taken from the iotune
    /// output.
    pub fn max_io_requests(mut self, val: usize) -> Self {
        self.max_io_requests = Some(val);
        self
    }

    pub fn num_io_queues(mut self, val: usize) -> Self {
        self.num_io_queues = Some(val);
        self
    }

    /// When false, file I/O may fall back to buffered I/O on filesystems
    /// that reject O_DIRECT, at a logged performance cost.
    pub fn strict_dma(mut self, val: bool) -> Self {
        self.strict_dma = val;
        self
    }

    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = val.into();
        self
    }

    /// Validates and boots the runtime.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg: Config = self.try_into()?;
        Runtime::start(cfg)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) shards: usize,
    pub(crate) cpuset: Option<Vec<usize>>,
    pub(crate) task_quota: Duration,
    pub(crate) poll_mode: bool,
    pub(crate) max_io_requests: Option<usize>,
    pub(crate) num_io_queues: Option<usize>,
    pub(crate) strict_dma: bool,
    pub(crate) thread_name: String,
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(anyhow!("shard count must be greater than 0"));
        }
        if let Some(cpus) = &self.cpuset {
            if cpus.len() < self.shards {
                return Err(anyhow!(
                    "cpuset holds {} cpus for {} shards",
                    cpus.len(),
                    self.shards
                ));
            }
        }
        if self.task_quota.is_zero() {
            return Err(anyhow!("task quota must be non-zero"));
        }
        if matches!(self.num_io_queues, Some(0)) {
            return Err(anyhow!("num-io-queues must be greater than 0"));
        }
        if matches!(self.max_io_requests, Some(0)) {
            return Err(anyhow!("max-io-requests must be greater than 0"));
        }
        Ok(())
    }
}

impl TryFrom<Builder> for Config {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self> {
        let cfg = Config {
            shards: builder.shards,
            cpuset: builder.cpuset,
            task_quota: builder.task_quota,
            poll_mode: builder.poll_mode,
            max_io_requests: builder.max_io_requests,
            num_io_queues: builder.num_io_queues,
            strict_dma: builder.strict_dma,
            thread_name: builder.thread_name,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

fn pin_to_cpu(cpu: usize) {
    let mut set = nix::sched::CpuSet::new();
    if set.set(cpu).is_ok() {
        if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set) {
            tracing::debug!("failed to pin to cpu {}: {}", cpu, e);
        }
    }
}

pub struct Runtime {
    smp: Arc<SmpContext>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    fn start(cfg: Config) -> Result<Self> {
        let smp = SmpContext::new(&cfg);
        let started = Arc::new(Barrier::new(cfg.shards));

        let mut threads = Vec::new();
        for shard in 1..cfg.shards {
            let cfg = cfg.clone();
            let smp = Arc::clone(&smp);
            let started = Arc::clone(&started);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", cfg.thread_name, shard))
                .spawn(move || {
                    let id = shard as u32;
                    pin_to_cpu(cfg.cpuset.as_ref().map_or(shard, |cpus| cpus[shard]));
                    let reactor = match Reactor::initialize(&cfg, id, Arc::clone(&smp)) {
                        Ok(r) => r,
                        Err(e) => {
                            // Release the barrier either way; the failure
                            // surfaces on first submit_to this shard.
                            tracing::warn!("shard {} failed to start: {:#}", id, e);
                            started.wait();
                            return;
                        }
                    };
                    started.wait();
                    reactor.main_loop(|| smp.is_stopping());
                    drop(reactor);
                    smp.unregister_shard(id);
                    Reactor::deinitialize();
                })?;
            threads.push(handle);
        }

        pin_to_cpu(cfg.cpuset.as_ref().map_or(0, |cpus| cpus[0]));
        let boot = Reactor::initialize(&cfg, 0, Arc::clone(&smp));
        started.wait();
        if let Err(e) = boot {
            smp.request_stop();
            for handle in threads {
                let _ = handle.join();
            }
            return Err(e);
        }

        Ok(Runtime { smp, threads })
    }

    /// Runs the shard-0 reactor loop until the future produced by `make`
    /// resolves, and returns its outcome.
    pub fn block_on<T, F>(&self, make: F) -> std::result::Result<T, Fault>
    where
        T: 'static,
        F: FnOnce() -> Future<T>,
    {
        Reactor::local().run_until(make)
    }

    pub fn shards(&self) -> u32 {
        self.smp.count()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.smp.request_stop();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.smp.unregister_shard(0);
        Reactor::deinitialize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // The config crosses into every spawned shard thread.
    assert_impl_all!(Config: Send, Sync, Clone);

    #[test]
    fn test_builder_rejects_bad_configs() {
        assert!(Builder::new()
            .cpuset(vec![0])
            .shards(2)
            .try_build()
            .is_err());
        assert!(Builder::new()
            .task_quota(Duration::ZERO)
            .try_build()
            .is_err());
        assert!(Builder::new().num_io_queues(0).try_build().is_err());
    }

    #[test]
    fn test_sequential_runtimes_on_one_thread() -> Result<()> {
        for round in 0..3 {
            let runtime = Builder::new().try_build()?;
            let got = runtime
                .block_on(|| crate::future::ready(round))
                .map_err(|e| anyhow!("{e:#}"))?;
            assert_eq!(got, round);
        }
        Ok(())
    }

    #[test]
    fn test_double_runtime_on_thread_fails() -> Result<()> {
        let _runtime = Builder::new().try_build()?;
        assert!(Builder::new().try_build().is_err());
        Ok(())
    }
}
