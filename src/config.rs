//! Option parsing for the host application: the CLI surface, the
//! line-oriented `key=value` configuration files, and the iotune output
//! formats.

use anyhow::{anyhow, bail, Context, Result};

/// Everything the runtime consumes from the command line and the config
/// files. Unset fields fall back to built-in defaults at build time.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AppOptions {
    pub smp: Option<usize>,
    pub cpuset: Option<Vec<usize>>,
    pub memory: Option<u64>,
    pub reserve_memory: Option<u64>,
    pub hugepages: Option<String>,
    pub task_quota_ms: Option<f64>,
    pub poll_mode: bool,
    pub network_stack: Option<String>,
    pub max_io_requests: Option<usize>,
    pub num_io_queues: Option<usize>,
    pub help: bool,
}

impl AppOptions {
    /// Parses command-line arguments (excluding argv[0]). Options take the
    /// form `--key=value`, `--key value`, or bare `--flag`.
    pub fn parse_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut opts = AppOptions::default();
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            let arg = arg.as_ref();
            let (key, inline_value) = match arg.split_once('=') {
                Some((k, v)) => (k, Some(v.to_string())),
                None => (arg, None),
            };
            let mut value = |name: &str| -> Result<String> {
                match &inline_value {
                    Some(v) => Ok(v.clone()),
                    None => iter
                        .next()
                        .map(|s| s.as_ref().to_string())
                        .ok_or_else(|| anyhow!("option {} requires a value", name)),
                }
            };
            match key {
                "-h" | "--help" => opts.help = true,
                "--poll-mode" => opts.poll_mode = true,
                "--smp" => opts.smp = Some(value("--smp")?.parse().context("--smp")?),
                "--cpuset" => opts.cpuset = Some(parse_cpuset(&value("--cpuset")?)?),
                "--memory" => opts.memory = Some(parse_size(&value("--memory")?)?),
                "--reserve-memory" => {
                    opts.reserve_memory = Some(parse_size(&value("--reserve-memory")?)?)
                }
                "--hugepages" => opts.hugepages = Some(value("--hugepages")?),
                "--task-quota-ms" => {
                    opts.task_quota_ms =
                        Some(value("--task-quota-ms")?.parse().context("--task-quota-ms")?)
                }
                "--network-stack" => {
                    let v = value("--network-stack")?;
                    if v != "posix" && v != "native" {
                        bail!("unknown network stack {:?}", v);
                    }
                    opts.network_stack = Some(v);
                }
                "--max-io-requests" => {
                    opts.max_io_requests =
                        Some(value("--max-io-requests")?.parse().context("--max-io-requests")?)
                }
                "--num-io-queues" => {
                    opts.num_io_queues =
                        Some(value("--num-io-queues")?.parse().context("--num-io-queues")?)
                }
                other => bail!("unrecognised option '{}'", other),
            }
        }
        Ok(opts)
    }

    /// Applies one configuration-file key. File values never override an
    /// option already given on the command line.
    pub fn apply_config_entry(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "smp" => fill(&mut self.smp, value.parse().context("smp")?),
            "cpuset" => fill(&mut self.cpuset, parse_cpuset(value)?),
            "memory" => fill(&mut self.memory, parse_size(value)?),
            "reserve-memory" => fill(&mut self.reserve_memory, parse_size(value)?),
            "hugepages" => fill(&mut self.hugepages, value.to_string()),
            "task-quota-ms" => fill(&mut self.task_quota_ms, value.parse().context("task-quota-ms")?),
            "poll-mode" => self.poll_mode = self.poll_mode || value.parse().context("poll-mode")?,
            "network-stack" => fill(&mut self.network_stack, value.to_string()),
            "max-io-requests" => fill(&mut self.max_io_requests, value.parse().context("max-io-requests")?),
            "num-io-queues" => fill(&mut self.num_io_queues, value.parse().context("num-io-queues")?),
            other => bail!("unknown configuration key '{}'", other),
        }
        Ok(())
    }

    pub fn usage(app_name: &str) -> String {
        format!(
            "usage: {} [options]\n\
             \n\
             App options:\n\
             \x20 -h, --help              show help message and exit\n\
             \x20 --smp=N                 number of shards (reactors)\n\
             \x20 --cpuset=LIST           cpus to pin shards to, e.g. 0-3,8\n\
             \x20 --memory=SIZE           memory to use, e.g. 4G\n\
             \x20 --reserve-memory=SIZE   memory to leave to the OS\n\
             \x20 --hugepages=PATH        hugetlbfs mount point\n\
             \x20 --task-quota-ms=MS      task processing slice\n\
             \x20 --poll-mode             busy-poll instead of sleeping\n\
             \x20 --network-stack=NAME    posix|native\n\
             \x20 --max-io-requests=N     disk concurrency per I/O queue\n\
             \x20 --num-io-queues=N       number of I/O coordinators\n",
            app_name
        )
    }
}

fn fill<T>(slot: &mut Option<T>, value: T) {
    if slot.is_none() {
        *slot = Some(value);
    }
}

/// Parses a cpu list: comma-separated ids and inclusive ranges ("0-3,8").
pub fn parse_cpuset(s: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            bail!("empty element in cpuset {:?}", s);
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().with_context(|| format!("cpuset {:?}", s))?;
                let hi: usize = hi.trim().parse().with_context(|| format!("cpuset {:?}", s))?;
                if hi < lo {
                    bail!("descending range in cpuset {:?}", s);
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().with_context(|| format!("cpuset {:?}", s))?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Parses a size with an optional K/M/G/T suffix (powers of two).
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 10),
        Some('m') | Some('M') => (&s[..s.len() - 1], 20),
        Some('g') | Some('G') => (&s[..s.len() - 1], 30),
        Some('t') | Some('T') => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let base: u64 = digits.trim().parse().with_context(|| format!("size {:?}", s))?;
    base.checked_mul(1u64 << shift)
        .ok_or_else(|| anyhow!("size {:?} overflows", s))
}

/// Line-oriented `key=value` configuration text: blank lines and `#`
/// comments are skipped; anything else must be an assignment.
pub fn parse_config_text(text: &str) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("line {}: expected key=value, got {:?}", lineno + 1, line))?;
        entries.push((key.trim().to_string(), value.trim().to_string()));
    }
    Ok(entries)
}

/// I/O settings discovered by the external iotune benchmark.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IotuneSettings {
    pub max_io_requests: Option<usize>,
    pub num_io_queues: Option<usize>,
}

/// Accepts both iotune output forms: plain `max-io-requests=N` /
/// `num-io-queues=N` lines, or the shell fragment
/// `APP_IO="--max-io-requests=N --num-io-queues=N"`.
pub fn parse_iotune_text(text: &str) -> Result<IotuneSettings> {
    let mut settings = IotuneSettings::default();
    for (key, value) in parse_config_text(text)? {
        match key.as_str() {
            "max-io-requests" => {
                settings.max_io_requests = Some(value.parse().context("max-io-requests")?)
            }
            "num-io-queues" => {
                settings.num_io_queues = Some(value.parse().context("num-io-queues")?)
            }
            k if k.ends_with("_IO") => {
                let fragment = value.trim_matches('"');
                for word in fragment.split_whitespace() {
                    match word.split_once('=') {
                        Some(("--max-io-requests", v)) => {
                            settings.max_io_requests = Some(v.parse().context("max-io-requests")?)
                        }
                        Some(("--num-io-queues", v)) => {
                            settings.num_io_queues = Some(v.parse().context("num-io-queues")?)
                        }
                        _ => bail!("unknown word {:?} in iotune fragment", word),
                    }
                }
            }
            other => bail!("unknown iotune key '{}'", other),
        }
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_args_full_surface() -> Result<()> {
        let opts = AppOptions::parse_args([
            "--smp=4",
            "--cpuset",
            "0-2,5",
            "--memory=2G",
            "--reserve-memory=512M",
            "--hugepages=/dev/hugepages",
            "--task-quota-ms=0.4",
            "--poll-mode",
            "--network-stack=posix",
            "--max-io-requests=64",
            "--num-io-queues=2",
        ])?;
        assert_eq!(opts.smp, Some(4));
        assert_eq!(opts.cpuset, Some(vec![0, 1, 2, 5]));
        assert_eq!(opts.memory, Some(2 << 30));
        assert_eq!(opts.reserve_memory, Some(512 << 20));
        assert_eq!(opts.hugepages.as_deref(), Some("/dev/hugepages"));
        assert_eq!(opts.task_quota_ms, Some(0.4));
        assert!(opts.poll_mode);
        assert_eq!(opts.max_io_requests, Some(64));
        assert_eq!(opts.num_io_queues, Some(2));
        Ok(())
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        assert!(AppOptions::parse_args(["--no-such-thing"]).is_err());
        assert!(AppOptions::parse_args(["--smp"]).is_err());
        assert!(AppOptions::parse_args(["--network-stack=exotic"]).is_err());
    }

    #[test]
    fn test_cli_wins_over_config_file() -> Result<()> {
        let mut opts = AppOptions::parse_args(["--smp=8"])?;
        opts.apply_config_entry("smp", "2")?;
        opts.apply_config_entry("max-io-requests", "32")?;
        assert_eq!(opts.smp, Some(8));
        assert_eq!(opts.max_io_requests, Some(32));
        Ok(())
    }

    #[test]
    fn test_config_text_rejects_unknown_keys() -> Result<()> {
        let mut opts = AppOptions::default();
        for (k, v) in parse_config_text("# comment\nsmp=2\n\ntask-quota-ms=1.5\n")? {
            opts.apply_config_entry(&k, &v)?;
        }
        assert_eq!(opts.smp, Some(2));
        assert_eq!(opts.task_quota_ms, Some(1.5));
        assert!(opts.apply_config_entry("colour", "blue").is_err());
        assert!(parse_config_text("this is not an assignment").is_err());
        Ok(())
    }

    #[rstest]
    #[case::key_value("max-io-requests=96\nnum-io-queues=3\n", Some(96), Some(3))]
    #[case::key_value_partial("max-io-requests=40\n", Some(40), None)]
    #[case::shell_fragment(
        "APP_IO=\"--max-io-requests=96 --num-io-queues=3\"\n",
        Some(96),
        Some(3)
    )]
    fn test_iotune_formats(
        #[case] text: &str,
        #[case] max_io: Option<usize>,
        #[case] queues: Option<usize>,
    ) {
        let settings = parse_iotune_text(text).unwrap();
        assert_eq!(settings.max_io_requests, max_io);
        assert_eq!(settings.num_io_queues, queues);
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("123").unwrap(), 123);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_parse_cpuset_shapes() {
        assert_eq!(parse_cpuset("3").unwrap(), vec![3]);
        assert_eq!(parse_cpuset("0-3,8").unwrap(), vec![0, 1, 2, 3, 8]);
        assert!(parse_cpuset("3-1").is_err());
        assert!(parse_cpuset("").is_err());
    }
}
