//! Container engine backed by the `docker` command line

use crate::runtime::container::engine::{
    BuildEvent, BuildRequest, BuildStream, ContainerEngine, ContainerInfo, EngineError,
    ImageInfo, OutputOrigin, PullProgress, PullStream,
};
use crate::runtime::container::spec::CreateOptions;
use crate::runtime::process::{read_chunks, OutputStream, Signal};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

static LAYER_LINE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]{12}): (.+)$").unwrap());

/// Drives containers through the `docker` executable
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: OsString,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: OsString::from("docker"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedImage {
    id: String,
    #[serde(default)]
    config: Option<InspectedConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    #[serde(default)]
    config: Option<InspectedConfig>,
    state: InspectedState,
    #[serde(default)]
    network_settings: Option<InspectedNetwork>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    #[serde(default)]
    exit_code: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

impl DockerCli {
    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Terminal interrupts must not be proxied straight into containers
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn describe(args: &[String]) -> String {
        format!("docker {}", args.join(" "))
    }

    /// Run a docker command to completion and return its stdout
    async fn run(&self, args: Vec<String>) -> Result<String, EngineError> {
        log::debug!("Running {}", Self::describe(&args));
        let output = self
            .command(&args)
            .output()
            .await
            .map_err(|e| EngineError::Io {
                command: Self::describe(&args),
                message: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("No such") {
            return Err(EngineError::NotFound(stderr));
        }
        Err(EngineError::Command {
            command: Self::describe(&args),
            message: stderr,
        })
    }

    /// Run a docker inspect command and decode its single result
    async fn inspect<T>(&self, args: Vec<String>) -> Result<T, EngineError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let stdout = self.run(args).await?;
        let mut results: Vec<T> =
            serde_json::from_str(&stdout).map_err(|e| EngineError::Decode(e.to_string()))?;
        if results.is_empty() {
            return Err(EngineError::Decode("empty inspect result".to_string()));
        }
        Ok(results.swap_remove(0))
    }

    fn spawn(&self, args: &[String]) -> Result<tokio::process::Child, EngineError> {
        log::debug!("Spawning {}", Self::describe(args));
        self.command(args).spawn().map_err(|e| EngineError::Io {
            command: Self::describe(args),
            message: e.to_string(),
        })
    }

    /// Command-line arguments for `docker create`
    fn create_args(name: &str, options: &CreateOptions) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        for (key, value) in &options.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for pair in &options.env {
            args.push("--env".to_string());
            args.push(pair.clone());
        }
        for port in &options.exposed_ports {
            args.push("--expose".to_string());
            args.push(port.clone());
        }
        for (port, bindings) in &options.port_bindings {
            for binding in bindings {
                args.push("--publish".to_string());
                args.push(format!("{}:{}:{}", binding.host_ip, binding.host_port, port));
            }
        }
        for bind in &options.binds {
            args.push("--volume".to_string());
            args.push(bind.clone());
        }
        for target in &options.volumes {
            args.push("--volume".to_string());
            args.push(target.clone());
        }
        if let Some(dir) = &options.working_dir {
            args.push("--workdir".to_string());
            args.push(dir.clone());
        }

        // The CLI takes a single entrypoint executable; its arguments lead the command
        let mut cmd = Vec::new();
        if let Some((program, rest)) = options.entrypoint.as_deref().and_then(<[String]>::split_first) {
            args.push("--entrypoint".to_string());
            args.push(program.clone());
            cmd.extend(rest.iter().cloned());
        }
        if let Some(command) = &options.cmd {
            cmd.extend(command.iter().cloned());
        }

        args.push(options.image.clone());
        args.extend(cmd);
        args
    }
}

/// Line-split a child pipe into tagged build events
fn build_lines<R>(reader: R, origin: OutputOrigin) -> BoxStream<'static, BuildEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::unfold(BufReader::new(reader).lines(), move |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(text)) => Some((BuildEvent::Line { origin, text }, lines)),
            _ => None,
        }
    })
    .boxed()
}

fn parse_pull_line(line: &str) -> PullProgress {
    match LAYER_LINE_PATTERN.captures(line) {
        Some(caps) => PullProgress {
            layer: Some(caps[1].to_string()),
            status: caps[2].to_string(),
            ..Default::default()
        },
        None => PullProgress {
            status: line.to_string(),
            ..Default::default()
        },
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, EngineError> {
        let image: InspectedImage = self
            .inspect(vec![
                "image".to_string(),
                "inspect".to_string(),
                reference.to_string(),
            ])
            .await?;
        Ok(ImageInfo {
            id: image.id,
            labels: image.config.and_then(|c| c.labels).unwrap_or_default(),
        })
    }

    async fn pull_image(&self, reference: &str) -> Result<PullStream, EngineError> {
        let args = vec!["pull".to_string(), reference.to_string()];
        let command = Self::describe(&args);
        let mut child = self.spawn(&args)?;

        let stdout = child.stdout.take().map(|out| build_lines(out, OutputOrigin::Stdout));
        let stderr = child.stderr.take();

        let progress = stdout
            .unwrap_or_else(|| futures::stream::empty().boxed())
            .filter_map(|event| async move {
                match event {
                    BuildEvent::Line { text, .. } => Some(Ok(parse_pull_line(&text))),
                    BuildEvent::Finished { .. } => None,
                }
            });

        let outcome = futures::stream::once(async move {
            let mut message = String::new();
            if let Some(mut stderr) = stderr {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut message).await;
            }
            match child.wait().await {
                Ok(status) if status.success() => None,
                Ok(_) if message.contains("No such") || message.contains("not found") => {
                    Some(Err(EngineError::NotFound(message.trim().to_string())))
                }
                Ok(_) => Some(Err(EngineError::Command {
                    command,
                    message: message.trim().to_string(),
                })),
                Err(e) => Some(Err(EngineError::Io {
                    command,
                    message: e.to_string(),
                })),
            }
        })
        .filter_map(futures::future::ready);

        Ok(progress.chain(outcome).boxed())
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<BuildStream, EngineError> {
        let mut args = vec![
            "build".to_string(),
            "--tag".to_string(),
            request.tag.clone(),
            "--file".to_string(),
            request.context.join(&request.dockerfile).display().to_string(),
        ];
        for (key, value) in &request.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(request.context.display().to_string());

        let mut child = self.spawn(&args)?;
        let stdout = child
            .stdout
            .take()
            .map(|out| build_lines(out, OutputOrigin::Stdout))
            .unwrap_or_else(|| futures::stream::empty().boxed());
        let stderr = child
            .stderr
            .take()
            .map(|err| build_lines(err, OutputOrigin::Stderr))
            .unwrap_or_else(|| futures::stream::empty().boxed());

        let finished = futures::stream::once(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().map(i64::from).unwrap_or(-1),
                Err(e) => {
                    log::warn!("Failed to wait for image build: {}", e);
                    -1
                }
            };
            BuildEvent::Finished { code }
        });

        Ok(futures::stream::select(stdout, stderr).chain(finished).boxed())
    }

    async fn create_container(
        &self,
        name: &str,
        options: &CreateOptions,
    ) -> Result<String, EngineError> {
        let stdout = self.run(Self::create_args(name, options)).await?;
        Ok(stdout.trim().to_string())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo, EngineError> {
        let container: InspectedContainer = self
            .inspect(vec![
                "container".to_string(),
                "inspect".to_string(),
                name.to_string(),
            ])
            .await?;
        Ok(ContainerInfo {
            id: container.id,
            labels: container.config.and_then(|c| c.labels).unwrap_or_default(),
            exit_code: container.state.exit_code,
            ip_address: container
                .network_settings
                .map(|n| n.ip_address)
                .unwrap_or_default(),
        })
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.run(vec!["start".to_string(), name.to_string()]).await?;
        Ok(())
    }

    async fn kill_container(&self, name: &str, signal: Signal) -> Result<(), EngineError> {
        self.run(vec![
            "kill".to_string(),
            "--signal".to_string(),
            signal.as_str().to_string(),
            name.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(name.to_string());
        self.run(args).await?;
        Ok(())
    }

    async fn attach_container(&self, name: &str) -> Result<OutputStream, EngineError> {
        // Attaching through `start` cannot miss output written right after start
        let args = vec![
            "start".to_string(),
            "--attach".to_string(),
            name.to_string(),
        ];
        let mut child = self.spawn(&args)?;
        let stdout = child.stdout.take().map(read_chunks);
        let stderr = child.stderr.take().map(read_chunks);
        let output = match (stdout, stderr) {
            (Some(out), Some(err)) => futures::stream::select(out, err).boxed(),
            (Some(out), None) => out,
            (None, Some(err)) => err,
            (None, None) => futures::stream::empty().boxed(),
        };

        // Reap the attach client once the output closes
        let reaper = futures::stream::once(async move {
            let _ = child.wait().await;
        })
        .filter_map(|_| futures::future::ready(None::<std::io::Result<Vec<u8>>>));

        Ok(output.chain(reaper).boxed())
    }

    async fn create_volume(&self, name: &str) -> Result<(), EngineError> {
        self.run(vec![
            "volume".to_string(),
            "create".to_string(),
            name.to_string(),
        ])
        .await?;
        Ok(())
    }
}
