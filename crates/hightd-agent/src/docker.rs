use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, HostConfigLogConfig, PortBinding};
use futures_util::StreamExt;

use crate::start_spec::Allocation;

/// Containers run the server process under this path; the sandbox directory
/// is bind-mounted onto it.
pub const CONTAINER_HOME: &str = "/home/hightd";

const LOG_MAX_SIZE: &str = "70k";
const LOG_MAX_FILE: &str = "1";
const CPU_PERIOD_US: i64 = 100_000;

#[derive(Debug, Clone)]
pub struct PullProgress {
    pub reference: String,
    pub status: String,
    pub progress: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    /// Final shell command, run as `/bin/sh -c {command}`.
    pub command: &'a str,
    pub env: Vec<String>,
    pub memory_mib: u64,
    /// Percent of one CPU times ten (1000 = one full CPU).
    pub cpu: u64,
    pub sandbox_dir: &'a Path,
    pub allocations: &'a [Allocation],
}

#[derive(Debug, Clone, Default)]
pub struct InspectSnapshot {
    pub running: bool,
    pub started_at: Option<String>,
}

/// Intent-level wrapper over the container runtime. The driver is the only
/// code in the agent that speaks to Docker; everything above it deals in
/// container names.
#[derive(Clone)]
pub struct ContainerDriver {
    docker: Docker,
}

impl ContainerDriver {
    pub fn connect() -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("connect to container runtime")?;
        Ok(Self { docker })
    }

    pub async fn pull<F>(&self, image: &str, mut on_progress: F) -> anyhow::Result<()>
    where
        F: FnMut(PullProgress),
    {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(item) = stream.next().await {
            let info = item.with_context(|| format!("pull image {image}"))?;
            on_progress(PullProgress {
                reference: info.id.unwrap_or_else(|| image.to_string()),
                status: info.status.unwrap_or_default(),
                progress: info.progress,
            });
        }
        Ok(())
    }

    pub async fn create(&self, spec: &ContainerSpec<'_>) -> anyhow::Result<()> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for alloc in spec.allocations {
            for proto in ["tcp", "udp"] {
                let key = format!("{}/{}", alloc.port, proto);
                exposed_ports.insert(key.clone(), HashMap::new());
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some(alloc.ip.clone()),
                        host_port: Some(alloc.port.to_string()),
                    }]),
                );
            }
        }

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}",
                spec.sandbox_dir.display(),
                CONTAINER_HOME
            )]),
            memory: Some((spec.memory_mib * 1024 * 1024) as i64),
            cpu_period: Some(CPU_PERIOD_US),
            cpu_quota: Some((spec.cpu * 100) as i64),
            port_bindings: Some(port_bindings),
            log_config: Some(HostConfigLogConfig {
                typ: Some("json-file".to_string()),
                config: Some(HashMap::from([
                    ("max-size".to_string(), LOG_MAX_SIZE.to_string()),
                    ("max-file".to_string(), LOG_MAX_FILE.to_string()),
                ])),
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.to_string()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                spec.command.to_string(),
            ]),
            env: Some(spec.env.clone()),
            working_dir: Some(CONTAINER_HOME.to_string()),
            tty: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(false),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .with_context(|| format!("create container {}", spec.name))?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> anyhow::Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("start container {name}"))?;
        Ok(())
    }

    pub async fn inspect(&self, name: &str) -> anyhow::Result<InspectSnapshot> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("inspect container {name}"))?;

        let state = info.state.unwrap_or_default();
        Ok(InspectSnapshot {
            running: state.status == Some(ContainerStateStatusEnum::RUNNING),
            started_at: state.started_at.filter(|s| !s.is_empty()),
        })
    }

    pub async fn attach(&self, name: &str) -> anyhow::Result<AttachContainerResults> {
        self.docker
            .attach_container(
                name,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    detach_keys: None,
                }),
            )
            .await
            .with_context(|| format!("attach container {name}"))
    }

    pub fn logs(
        &self,
        name: &str,
        tail: u32,
        follow: bool,
    ) -> futures_util::stream::BoxStream<'static, Result<LogOutput, bollard::errors::Error>> {
        self.docker
            .logs(
                name,
                Some(LogsOptions::<String> {
                    follow,
                    stdout: true,
                    stderr: true,
                    tail: tail.to_string(),
                    ..Default::default()
                }),
            )
            .boxed()
    }

    /// One-shot stats snapshot.
    pub async fn stats(&self, name: &str) -> anyhow::Result<Stats> {
        let mut stream = self.docker.stats(
            name,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        match stream.next().await {
            Some(stats) => stats.with_context(|| format!("stats for container {name}")),
            None => anyhow::bail!("no stats for container {name}"),
        }
    }

    /// Resolves when the container exits, yielding its exit code.
    pub async fn wait(&self, name: &str) -> anyhow::Result<i64> {
        let mut stream = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(resp)) => Ok(resp.status_code),
            // The wait endpoint reports a non-zero exit as an error body on
            // some runtime versions; the container is gone either way.
            Some(Err(err)) => {
                tracing::debug!(%err, container = name, "wait ended with runtime error");
                Ok(-1)
            }
            None => Ok(-1),
        }
    }

    pub async fn kill(&self, name: &str) -> anyhow::Result<()> {
        self.docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await
            .with_context(|| format!("kill container {name}"))?;
        Ok(())
    }

    pub async fn remove(&self, name: &str, force: bool) -> anyhow::Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("remove container {name}"))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSnapshot {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
}

/// Reduce a raw stats snapshot with the classical delta formula: cpu and
/// system deltas against the previous sample, scaled by online CPUs,
/// rounded to two decimals. Memory is taken directly.
pub fn reduce_stats(stats: &Stats) -> UsageSnapshot {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
    let sys_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));

    let cpu_percent = if cpu_delta > 0 && sys_delta > 0 {
        let online = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        let raw = (cpu_delta as f64 / sys_delta as f64) * online * 100.0;
        (raw * 100.0).round() / 100.0
    } else {
        0.0
    };

    UsageSnapshot {
        cpu_percent,
        memory_bytes: stats.memory_stats.usage.unwrap_or(0),
        memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_json(
        cpu_total: u64,
        precpu_total: u64,
        system: u64,
        presystem: u64,
        online: u64,
        mem_usage: u64,
        mem_limit: u64,
    ) -> Stats {
        serde_json::from_value(serde_json::json!({
            "name": "/hightd-test",
            "id": "abc123",
            "read": "2024-01-01T00:00:01Z",
            "preread": "2024-01-01T00:00:00Z",
            "pids_stats": {},
            "blkio_stats": {},
            "num_procs": 0,
            "storage_stats": {},
            "cpu_stats": {
                "cpu_usage": {
                    "total_usage": cpu_total,
                    "usage_in_usermode": 0,
                    "usage_in_kernelmode": 0
                },
                "system_cpu_usage": system,
                "online_cpus": online,
                "throttling_data": {
                    "periods": 0,
                    "throttled_periods": 0,
                    "throttled_time": 0
                }
            },
            "precpu_stats": {
                "cpu_usage": {
                    "total_usage": precpu_total,
                    "usage_in_usermode": 0,
                    "usage_in_kernelmode": 0
                },
                "system_cpu_usage": presystem,
                "throttling_data": {
                    "periods": 0,
                    "throttled_periods": 0,
                    "throttled_time": 0
                }
            },
            "memory_stats": {
                "usage": mem_usage,
                "limit": mem_limit
            }
        }))
        .unwrap()
    }

    #[test]
    fn cpu_percent_uses_deltas_scaled_by_online_cpus() {
        // 25% of the system delta across 4 CPUs -> 100%.
        let stats = stats_json(500, 250, 2000, 1000, 4, 1024, 4096);
        let usage = reduce_stats(&stats);
        assert_eq!(usage.cpu_percent, 100.0);
        assert_eq!(usage.memory_bytes, 1024);
        assert_eq!(usage.memory_limit_bytes, 4096);
    }

    #[test]
    fn cpu_percent_rounds_to_two_decimals() {
        // 1/3 of the system delta on one CPU -> 33.33%.
        let stats = stats_json(1000, 0, 3000, 0, 1, 0, 0);
        let usage = reduce_stats(&stats);
        assert_eq!(usage.cpu_percent, 33.33);
    }

    #[test]
    fn zero_deltas_yield_zero_cpu() {
        let stats = stats_json(100, 100, 500, 500, 2, 10, 20);
        assert_eq!(reduce_stats(&stats).cpu_percent, 0.0);
    }
}
