//! The application template: parses the CLI and the per-user config
//! files, boots the runtime, runs the application future on shard 0 and
//! turns its outcome into the process exit code.
//!
//! Exit-code contract: unknown options and bad configuration exit 2,
//! `--help` prints and exits 1, otherwise the process exits with whatever
//! the application future resolves to (1 on an uncaught failure).

use crate::config::{parse_config_text, parse_iotune_text, AppOptions};
use crate::future::{ready, Future};
use crate::reactor::Reactor;
use crate::runtime::{Builder, Runtime};
use crate::task::make_task;
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

pub struct AppTemplate {
    name: String,
}

impl AppTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn config_dir(&self) -> Option<PathBuf> {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".config").join(&self.name))
    }

    fn load_config_files(&self, opts: &mut AppOptions) -> anyhow::Result<()> {
        let Some(dir) = self.config_dir() else {
            return Ok(());
        };
        let app_conf = dir.join("app.conf");
        if let Ok(text) = std::fs::read_to_string(&app_conf) {
            for (key, value) in parse_config_text(&text)? {
                opts.apply_config_entry(&key, &value)
                    .map_err(|e| e.context(format!("{}", app_conf.display())))?;
            }
        }
        let io_conf = dir.join("io.conf");
        if let Ok(text) = std::fs::read_to_string(&io_conf) {
            let io = parse_iotune_text(&text)
                .map_err(|e| e.context(format!("{}", io_conf.display())))?;
            if opts.max_io_requests.is_none() {
                opts.max_io_requests = io.max_io_requests;
            }
            if opts.num_io_queues.is_none() {
                opts.num_io_queues = io.num_io_queues;
            }
        }
        Ok(())
    }

    fn build_runtime(&self, opts: &AppOptions) -> anyhow::Result<Runtime> {
        let mut builder = Builder::new()
            .shards(opts.smp.unwrap_or(1))
            .poll_mode(opts.poll_mode)
            .thread_name(format!("{}-shard", self.name));
        if let Some(cpus) = &opts.cpuset {
            builder = builder.cpuset(cpus.clone());
        }
        if let Some(ms) = opts.task_quota_ms {
            builder = builder.task_quota(Duration::from_secs_f64(ms / 1000.0));
        }
        if let Some(n) = opts.max_io_requests {
            builder = builder.max_io_requests(n);
        }
        if let Some(n) = opts.num_io_queues {
            builder = builder.num_io_queues(n);
        }
        builder.try_build()
    }

    /// Parses `args` (argv[0] included), boots, runs `func` on shard 0 and
    /// returns the process exit code. SIGINT/SIGTERM trigger a graceful
    /// shutdown running the registered exit hooks.
    pub fn run<F>(&self, args: Vec<String>, func: F) -> i32
    where
        F: FnOnce() -> Future<i32> + 'static,
    {
        let mut opts = match AppOptions::parse_args(args.iter().skip(1).map(|s| s.as_str())) {
            Ok(opts) => opts,
            Err(e) => {
                eprintln!("error: {e:#}\n\nTry --help.");
                return 2;
            }
        };
        if opts.help {
            print!("{}", AppOptions::usage(&self.name));
            return 1;
        }
        if let Err(e) = self.load_config_files(&mut opts) {
            eprintln!("error: {e:#}\n\nTry --help.");
            return 2;
        }

        let runtime = match self.build_runtime(&opts) {
            Ok(runtime) => runtime,
            Err(e) => {
                eprintln!("error: {e:#}");
                return 1;
            }
        };

        let reactor = Reactor::local();
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            let r = Rc::clone(&reactor);
            if let Err(e) = reactor.signals().handle_signal(signal, move || r.stop()) {
                tracing::warn!("cannot install {} handler: {}", signal, e);
            }
        }

        let r = Rc::clone(&reactor);
        reactor.add_task(make_task(move || {
            func()
                .then_wrapped(move |f| {
                    match f.into_result() {
                        Ok(code) => r.exit(code),
                        Err(e) => {
                            eprintln!("program failed with uncaught exception: {e:#}");
                            r.exit(1);
                        }
                    }
                    ready(())
                })
                .ignore_ready_future();
        }));

        let code = reactor.run();
        drop(runtime);
        code
    }
}
