// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Project operations: start, stop, restart, destroy, status and sandboxes.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use super::types::{
    DestroyOutcome, ProjectStatusReport, ProjectSummary, StartOptions, StartOutcome, StopOutcome,
};
use super::Orchestrator;
use crate::config::expand_args;
use crate::error::{FleetError, FleetResult};
use crate::identity::RepoIdentity;
use crate::keys::{deploy_key_for, DeployKey};
use crate::process::{ProcessError, SpawnRequest};
use crate::router_config::EndpointRegistration;
use crate::sandbox::{GitError, SandboxInfo};
use crate::state::{ErrorStage, ProcessUpdate, ProjectRecord, ProjectStatus, SandboxRecord};
#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::{self, Counter};

/// What a launch attempt produced.
enum Launch {
    Running(ProjectRecord),
    AwaitingCredential(DeployKey),
}

/// Record an operation outcome in the global metrics.
pub(super) fn observe<T>(name: &str, started: Instant, result: &FleetResult<T>) {
    #[cfg(feature = "telemetry")]
    metrics::record_outcome(name, started.elapsed(), result.is_ok());
    #[cfg(not(feature = "telemetry"))]
    let _ = (name, started, result);
}

impl Orchestrator {
    /// Start the agent for `url`, cloning first if needed.
    ///
    /// Starting a project that is already up is an idempotent update: its
    /// router entry is refreshed and nothing is spawned.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, options), fields(key)))]
    pub async fn start(&self, url: &str, options: StartOptions) -> FleetResult<StartOutcome> {
        let started = Instant::now();
        let identity = RepoIdentity::parse(url)?;
        let key = identity.key();
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("key", key.as_str());

        let _guard = self.lock_project(&key).await;
        let result = self.start_unlocked(&identity, &key, options).await;
        observe("project.start", started, &result);
        result
    }

    async fn start_unlocked(
        &self,
        identity: &RepoIdentity,
        key: &str,
        options: StartOptions,
    ) -> FleetResult<StartOutcome> {
        let record = self.ensure_record(identity, options.base_dir).await?;
        let preferred_port = options.port.or(record.process.port);

        match record.process.status {
            ProjectStatus::Running => {
                if let Some(pid) = self.live_pid(&record) {
                    info!(pid, "Project {} already running", key);
                    let port = record.process.port.unwrap_or_default();
                    let router_error = self.publish(&record, port).await?;
                    return Ok(StartOutcome::AlreadyRunning {
                        project: ProjectSummary::from_record(&record, &self.config.agent.hostname, true),
                        router_error,
                    });
                }
                self.mark_crashed(&record).await?;
            }
            ProjectStatus::Starting | ProjectStatus::Stopping => {
                warn!("Project {} was left {}; resetting", key, record.process.status);
                let halted = self.halt(&record).await;
                if record.process.status.is_counted() {
                    self.router_config.set_active(key, false).await?;
                    self.store.decrement_active_projects().await?;
                }
                if let Err(e) = halted {
                    self.settle_router(key).await;
                    return Err(e);
                }
            }
            ProjectStatus::Stopped | ProjectStatus::Failed => {
                if let Some(pid) = self.live_pid(&record) {
                    warn!(pid, "Project {} still has a process; stopping it first", key);
                    self.halt(&record).await?;
                }
            }
        }

        let launched = match self.launch(identity, key, preferred_port).await {
            Ok(launched) => launched,
            Err(e) => {
                self.settle_router(key).await;
                return Err(e);
            }
        };
        match launched {
            Launch::Running(record) => {
                let active = self.store.increment_active_projects().await?;
                debug!(active, "Active projects");
                let port = record.process.port.unwrap_or_default();
                let router_error = self.publish(&record, port).await?;
                Ok(StartOutcome::Started {
                    project: ProjectSummary::from_record(&record, &self.config.agent.hostname, true),
                    router_error,
                })
            }
            Launch::AwaitingCredential(deploy_key) => {
                self.settle_router(key).await;
                Ok(StartOutcome::AwaitingCredential { deploy_key })
            }
        }
    }

    /// Stop the agent for `url`. Stopping a stopped project is a no-op.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(key)))]
    pub async fn stop(&self, url: &str) -> FleetResult<StopOutcome> {
        let started = Instant::now();
        let key = RepoIdentity::parse(url)?.key();
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("key", key.as_str());

        let _guard = self.lock_project(&key).await;
        let result = self.stop_unlocked(&key).await;
        observe("project.stop", started, &result);
        result
    }

    async fn stop_unlocked(&self, key: &str) -> FleetResult<StopOutcome> {
        let record = self.project(key).await?;
        let was_counted = record.process.status.is_counted();

        // Whether or not the process went away, the record is no longer
        // RUNNING, so its slot and router entry are released either way.
        let halted = self.halt(&record).await;
        self.router_config.set_active(key, false).await?;

        let active = if was_counted {
            self.store.decrement_active_projects().await?
        } else {
            self.store.get_router_state().await?.active_project_count
        };
        let router_stopped = self.stop_router_if_idle().await?;
        let was_running = halted?;

        info!(active, "Project {} stopped", key);
        Ok(StopOutcome {
            key: key.to_string(),
            was_running,
            active_projects: active,
            router_stopped,
        })
    }

    /// Stop then start again on the previous port when it is free.
    ///
    /// A project that was running stays counted once; the counter only moves
    /// when the project ends up in a different running state than before.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(key)))]
    pub async fn restart(&self, url: &str) -> FleetResult<StartOutcome> {
        let started = Instant::now();
        let identity = RepoIdentity::parse(url)?;
        let key = identity.key();
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("key", key.as_str());

        let _guard = self.lock_project(&key).await;
        let result = self.restart_unlocked(&identity, &key).await;
        observe("project.restart", started, &result);
        result
    }

    async fn restart_unlocked(&self, identity: &RepoIdentity, key: &str) -> FleetResult<StartOutcome> {
        let record = self.project(key).await?;
        let was_counted = record.process.status.is_counted();
        let previous_port = record.process.port;

        if let Err(e) = self.halt(&record).await {
            if let Err(release_err) = self.release(key, was_counted).await {
                warn!("Cleanup after failed stop of {}: {}", key, release_err);
            }
            return Err(e);
        }

        match self.launch(identity, key, previous_port).await {
            Ok(Launch::Running(record)) => {
                if !was_counted {
                    self.store.increment_active_projects().await?;
                }
                let port = record.process.port.unwrap_or_default();
                let router_error = self.publish(&record, port).await?;
                info!(port, "Project {} restarted", key);
                Ok(StartOutcome::Started {
                    project: ProjectSummary::from_record(&record, &self.config.agent.hostname, true),
                    router_error,
                })
            }
            Ok(Launch::AwaitingCredential(deploy_key)) => {
                self.release(key, was_counted).await?;
                Ok(StartOutcome::AwaitingCredential { deploy_key })
            }
            Err(e) => {
                if let Err(release_err) = self.release(key, was_counted).await {
                    warn!("Cleanup after failed restart of {}: {}", key, release_err);
                }
                Err(e)
            }
        }
    }

    /// Stop, unregister, and delete the project's working copy and record.
    ///
    /// The deploy key is kept so a re-created project needs no new upstream
    /// registration.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(key)))]
    pub async fn destroy(&self, url: &str) -> FleetResult<DestroyOutcome> {
        let started = Instant::now();
        let key = RepoIdentity::parse(url)?.key();
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("key", key.as_str());

        let guard = self.lock_project(&key).await;
        let result = self.destroy_unlocked(&key).await;
        drop(guard);
        if result.is_ok() {
            self.drop_project_lock(&key);
        }
        observe("project.destroy", started, &result);
        result
    }

    async fn destroy_unlocked(&self, key: &str) -> FleetResult<DestroyOutcome> {
        let record = self.project(key).await?;
        let stop = self.stop_unlocked(key).await?;
        self.router_config.remove(key).await?;

        let removed_dir = self.remove_base_dir(&record.base_dir)?;
        let log = self.log_path(&record.display_name);
        if let Err(e) = std::fs::remove_file(&log) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove log {}: {}", log.display(), e);
            }
        }

        self.store.delete(key).await?;
        info!("Project {} destroyed", key);
        Ok(DestroyOutcome {
            key: key.to_string(),
            stop,
            removed_dir,
        })
    }

    /// Current status of one project.
    ///
    /// A project recorded RUNNING whose process is gone is marked FAILED
    /// (stage `crash`) here, and the router is stopped if nothing else runs.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(key)))]
    pub async fn status(&self, url: &str) -> FleetResult<ProjectStatusReport> {
        let key = RepoIdentity::parse(url)?.key();
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("key", key.as_str());

        let _guard = self.lock_project(&key).await;
        let mut record = self.project(&key).await?;

        let mut crashed = false;
        if record.process.status == ProjectStatus::Running && self.live_pid(&record).is_none() {
            record = self.mark_crashed(&record).await?;
            self.stop_router_if_idle().await?;
            crashed = true;
        }

        let alive = self.live_pid(&record).is_some();
        let health = match (alive, record.process.port) {
            (true, Some(port)) => {
                let url = format!("{}{}", self.agent_url(port), self.config.agent.health_path);
                let report = self.supervisor.probe(&url, &self.agent_auth()).await;
                if report.healthy {
                    record = self
                        .store
                        .update_process_status(&key, ProcessUpdate::default().healthy_now())
                        .await?;
                }
                Some(report)
            }
            _ => None,
        };

        let router_entry = self.router_config.get(&key).await?;
        Ok(ProjectStatusReport {
            project: ProjectSummary::from_record(&record, &self.config.agent.hostname, alive),
            record,
            crashed,
            health,
            router_entry,
        })
    }

    /// Every known project, sorted by key.
    pub async fn list(&self) -> FleetResult<Vec<ProjectSummary>> {
        let records = self.store.list_records().await?;
        Ok(records
            .iter()
            .map(|record| {
                let alive = self.live_pid(record).is_some();
                ProjectSummary::from_record(record, &self.config.agent.hostname, alive)
            })
            .collect())
    }

    /// Record the identifier the agent assigned to this project.
    pub async fn set_project_id(&self, url: &str, project_id: &str) -> FleetResult<ProjectRecord> {
        let key = RepoIdentity::parse(url)?.key();
        let _guard = self.lock_project(&key).await;
        self.project(&key).await?;
        let id = project_id.trim().to_string();
        let record = self
            .store
            .update_project(&key, |record| {
                record.project_id = if id.is_empty() { None } else { Some(id) };
                Ok(record.clone())
            })
            .await?;
        Ok(record)
    }

    /// The project's deploy key and how to register it, creating it if needed.
    pub async fn get_deploy_key(&self, url: &str) -> FleetResult<DeployKey> {
        let identity = RepoIdentity::parse(url)?;
        Ok(deploy_key_for(self.keys.as_ref(), &identity).await?)
    }

    // ------------------------------------------------------------------
    // Sandboxes
    // ------------------------------------------------------------------

    #[cfg_attr(feature = "telemetry", instrument(skip(self, start_command), fields(key)))]
    pub async fn create_sandbox(
        &self,
        url: &str,
        name: &str,
        branch: Option<&str>,
        start_command: Option<&str>,
    ) -> FleetResult<SandboxRecord> {
        let started = Instant::now();
        let key = RepoIdentity::parse(url)?.key();
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("key", key.as_str());

        let _guard = self.lock_project(&key).await;
        let result = self
            .sandboxes()
            .create(&key, name, branch, start_command)
            .await
            .map_err(FleetError::from);
        observe("sandbox.create", started, &result);
        result
    }

    pub async fn list_sandboxes(&self, url: &str) -> FleetResult<Vec<SandboxInfo>> {
        let key = RepoIdentity::parse(url)?.key();
        Ok(self.sandboxes().list(&key).await?)
    }

    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(key)))]
    pub async fn delete_sandbox(&self, url: &str, name: &str) -> FleetResult<SandboxRecord> {
        let key = RepoIdentity::parse(url)?.key();
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("key", key.as_str());

        let _guard = self.lock_project(&key).await;
        Ok(self.sandboxes().delete(&key, name).await?)
    }

    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(key)))]
    pub async fn reset_sandbox(&self, url: &str, name: &str) -> FleetResult<SandboxRecord> {
        let key = RepoIdentity::parse(url)?.key();
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("key", key.as_str());

        let _guard = self.lock_project(&key).await;
        Ok(self.sandboxes().reset(&key, name).await?)
    }

    // ------------------------------------------------------------------
    // Internals (project lock held by the caller)
    // ------------------------------------------------------------------

    async fn project(&self, key: &str) -> FleetResult<ProjectRecord> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| FleetError::ProjectNotFound(key.to_string()))
    }

    /// The recorded pid, if that process is alive.
    pub(super) fn live_pid(&self, record: &ProjectRecord) -> Option<u32> {
        record
            .process
            .pid
            .filter(|pid| self.supervisor.is_running(*pid))
    }

    /// Load the record for `identity`, creating it on first sight.
    ///
    /// A base directory override only applies to new projects; two projects
    /// may never share a base directory.
    async fn ensure_record(
        &self,
        identity: &RepoIdentity,
        base_dir: Option<PathBuf>,
    ) -> FleetResult<ProjectRecord> {
        let key = identity.key();
        let display_name = identity.display_name();
        let default_dir = self.config.projects_root.join(&display_name);

        let outcome = self
            .store
            .mutate(|state| {
                if let Some(existing) = state.projects.get(&key) {
                    if let Some(ref dir) = base_dir {
                        if dir != &existing.base_dir {
                            warn!(
                                "Ignoring base dir {} for existing project {} (uses {})",
                                dir.display(),
                                key,
                                existing.base_dir.display()
                            );
                        }
                    }
                    return Ok(Ok(existing.clone()));
                }

                let dir = base_dir.unwrap_or(default_dir);
                if let Some(other) = state.projects.values().find(|p| p.base_dir == dir) {
                    return Ok(Err(FleetError::BaseDirConflict {
                        path: dir,
                        other: other.repo_url.clone(),
                    }));
                }
                let record = ProjectRecord::new(key.clone(), display_name, dir);
                state.projects.insert(key.clone(), record.clone());
                Ok(Ok(record))
            })
            .await?;

        if let Ok(ref record) = outcome {
            debug!("Project {} at {}", record.repo_url, record.base_dir.display());
        }
        outcome
    }

    /// Clone if needed, then spawn and health-check the agent.
    ///
    /// On success the record is RUNNING; the caller owns the counter and the
    /// router. Every failure leaves the record FAILED with its stage.
    async fn launch(
        &self,
        identity: &RepoIdentity,
        key: &str,
        preferred_port: Option<u16>,
    ) -> FleetResult<Launch> {
        let record = self
            .store
            .update_process_status(
                key,
                ProcessUpdate::status(ProjectStatus::Starting)
                    .with_pid(None)
                    .clear_error(),
            )
            .await?;

        // clone
        let repo_dir = record.repo_dir();
        if !self.git.is_repository(&repo_dir) {
            let display_name = identity.display_name();
            if let Err(e) = self.keys.ensure_key(&display_name).await {
                return Err(self.fail(key, ErrorStage::Clone, e.to_string()).await);
            }
            if let Some(parent) = repo_dir.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Err(self.fail(key, ErrorStage::Clone, e.to_string()).await);
                }
            }

            info!("Cloning {} into {}", key, repo_dir.display());
            let ssh_key = self.keys.private_key_path(&display_name);
            match self.git.clone_repo(key, &repo_dir, Some(&ssh_key)).await {
                Ok(()) => {}
                Err(GitError::AccessDenied(message)) => {
                    warn!("Clone of {} was refused; waiting for deploy key", key);
                    self.store
                        .update_process_status(
                            key,
                            ProcessUpdate::status(ProjectStatus::Stopped)
                                .with_note(format!("awaiting deploy key: {}", message)),
                        )
                        .await?;
                    let deploy_key = deploy_key_for(self.keys.as_ref(), identity).await?;
                    return Ok(Launch::AwaitingCredential(deploy_key));
                }
                Err(e) => return Err(self.fail(key, ErrorStage::Clone, e.to_string()).await),
            }
        }

        // binary
        let agent = &self.config.agent;
        if !self.supervisor.binary_exists(&agent.command) {
            let message = ProcessError::BinaryNotFound(agent.command.clone()).to_string();
            return Err(self.fail(key, ErrorStage::Binary, message).await);
        }

        // port
        let port = match self.choose_agent_port(key, preferred_port).await {
            Ok(port) => port,
            Err(e) => return Err(self.fail(key, ErrorStage::Port, e.to_string()).await),
        };

        // spawn
        let request = self.agent_spawn_request(&record, port);
        info!(port, "Spawning agent for {}: {}", key, request.command_line());
        let pid = match self.supervisor.spawn(request).await {
            Ok(pid) => pid,
            Err(e) => return Err(self.fail(key, ErrorStage::Spawn, e.to_string()).await),
        };
        #[cfg(feature = "telemetry")]
        metrics::increment(Counter::Spawn);
        self.store
            .update_process_status(
                key,
                ProcessUpdate::default()
                    .with_pid(Some(pid))
                    .with_port(Some(port))
                    .started_now(),
            )
            .await?;

        // health
        let timeouts = &self.config.timeouts;
        let url = format!("{}{}", self.agent_url(port), agent.health_path);
        let report = self
            .supervisor
            .health_check(
                &url,
                &self.agent_auth(),
                timeouts.health_timeout(),
                timeouts.health_interval(),
            )
            .await;
        if !report.healthy {
            #[cfg(feature = "telemetry")]
            metrics::increment(Counter::HealthFailure);
            if let Err(e) = self.supervisor.terminate(pid, timeouts.terminate_timeout()).await {
                warn!(pid, "Failed to stop unhealthy agent: {}", e);
            }
            let message = ProcessError::HealthTimeout {
                url,
                elapsed_ms: report.elapsed_ms,
                last_message: report.message,
            }
            .to_string();
            return Err(self.fail(key, ErrorStage::Health, message).await);
        }

        let record = self
            .store
            .update_process_status(
                key,
                ProcessUpdate::status(ProjectStatus::Running)
                    .clear_error()
                    .healthy_now(),
            )
            .await?;
        info!(pid, port, "Project {} running", key);
        Ok(Launch::Running(record))
    }

    /// Mark a failed start and build the error to return.
    async fn fail(&self, key: &str, stage: ErrorStage, message: String) -> FleetError {
        error!(stage = stage.as_str(), "Start of {} failed: {}", key, message);
        let update = ProcessUpdate::status(ProjectStatus::Failed)
            .with_pid(None)
            .with_error(stage, message.clone());
        if let Err(e) = self.store.update_process_status(key, update).await {
            return e.into();
        }
        FleetError::StartFailed {
            key: key.to_string(),
            stage: stage.to_string(),
            message,
        }
    }

    /// Reuse `preferred` when possible, clearing a stale listener once;
    /// otherwise search the range, skipping ports other projects hold.
    async fn choose_agent_port(&self, key: &str, preferred: Option<u16>) -> FleetResult<u16> {
        let taken: Vec<u16> = self
            .store
            .read(|state| {
                state
                    .projects
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .filter_map(|(_, p)| p.process.port)
                    .collect()
            })
            .await?;

        if let Some(port) = preferred.filter(|p| !taken.contains(p)) {
            if self.supervisor.port_is_free(port) {
                return Ok(port);
            }
            let killed = self
                .supervisor
                .kill_process_on_port(port, self.config.timeouts.terminate_timeout())
                .await;
            if !killed.is_empty() {
                warn!(port, ?killed, "Killed stale listener");
                #[cfg(feature = "telemetry")]
                metrics::increment(Counter::StalePortKill);
            }
            if self.supervisor.port_is_free(port) {
                return Ok(port);
            }
            warn!(port, "Port still busy; searching the range");
        }

        let agent = &self.config.agent;
        Ok(self
            .supervisor
            .find_free_port(agent.port_range_start, agent.port_range_end, &taken)?)
    }

    fn agent_spawn_request(&self, record: &ProjectRecord, port: u16) -> SpawnRequest {
        let agent = &self.config.agent;
        let mut env = agent.env.clone();
        env.insert(agent.password_env.clone(), self.secrets.server_password.clone());
        SpawnRequest {
            program: agent.command.clone(),
            args: expand_args(&agent.args, port, &agent.hostname),
            env,
            cwd: record.repo_dir(),
            log_file: self.log_path(&record.display_name),
            port,
            signature: format!("--port {}", port),
        }
    }

    /// Register the endpoint and make sure the router runs.
    ///
    /// Returns the router failure, if any, without failing the project.
    async fn publish(&self, record: &ProjectRecord, port: u16) -> FleetResult<Option<String>> {
        let mut registration = EndpointRegistration::new(
            record.repo_url.clone(),
            self.config.agent.hostname.clone(),
            port,
            self.secrets.server_password.clone(),
        );
        registration.display_name = Some(record.display_name.clone());
        registration.ssh_key_path = Some(self.keys.private_key_path(&record.display_name));
        registration.repo_url = Some(record.repo_url.clone());
        registration.base_dir = Some(record.base_dir.clone());
        self.router_config.add_or_update(registration).await?;

        match self.ensure_router_running().await {
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("Router not available after starting {}: {}", record.repo_url, e);
                Ok(Some(e.to_string()))
            }
        }
    }

    /// Terminate the project's process if alive and leave the record STOPPED.
    /// Returns whether a live process was stopped. The counter is untouched.
    ///
    /// When termination fails the record is FAILED at stage `stop` and keeps
    /// the pid if the process is still alive.
    async fn halt(&self, record: &ProjectRecord) -> FleetResult<bool> {
        let key = record.repo_url.as_str();
        let status = record.process.status;
        if status == ProjectStatus::Running {
            self.store
                .update_process_status(key, ProcessUpdate::status(ProjectStatus::Stopping))
                .await?;
        }

        let pid = self.live_pid(record);
        if let Some(pid) = pid {
            match self
                .supervisor
                .terminate(pid, self.config.timeouts.terminate_timeout())
                .await
            {
                Ok(true) => {
                    warn!(pid, "Agent for {} needed SIGKILL", key);
                    #[cfg(feature = "telemetry")]
                    metrics::increment(Counter::KillEscalation);
                }
                Ok(false) => debug!(pid, "Agent for {} exited", key),
                Err(e) => {
                    let update = if matches!(status, ProjectStatus::Running | ProjectStatus::Stopping) {
                        ProcessUpdate::status(ProjectStatus::Failed)
                    } else {
                        ProcessUpdate::default()
                    };
                    // A survivor stays recorded so the next start stops it
                    // instead of launching beside it.
                    let survivor = self.supervisor.is_running(pid).then_some(pid);
                    self.store
                        .update_process_status(
                            key,
                            update.with_pid(survivor).with_error(ErrorStage::Stop, e.to_string()),
                        )
                        .await?;
                    return Err(e.into());
                }
            }
        }

        let mut update = ProcessUpdate::status(ProjectStatus::Stopped).with_pid(None);
        if status == ProjectStatus::Running {
            update = update.clear_error();
        }
        self.store.update_process_status(key, update).await?;
        Ok(pid.is_some())
    }

    /// A RUNNING record with a dead process: FAILED at stage `crash`, entry
    /// inactive, counter decremented. The router is left to the caller.
    async fn mark_crashed(&self, record: &ProjectRecord) -> FleetResult<ProjectRecord> {
        let key = record.repo_url.as_str();
        let message = match record.process.pid {
            Some(pid) => format!("process {} is no longer running", pid),
            None => "no process recorded".to_string(),
        };
        warn!("Project {} crashed: {}", key, message);
        #[cfg(feature = "telemetry")]
        metrics::increment(Counter::OrphanCorrected);

        let updated = self
            .store
            .update_process_status(
                key,
                ProcessUpdate::status(ProjectStatus::Failed)
                    .with_pid(None)
                    .with_error(ErrorStage::Crash, message),
            )
            .await?;
        self.router_config.set_active(key, false).await?;
        self.store.decrement_active_projects().await?;
        Ok(updated)
    }

    /// Stop the router if idle after a failed start. The start's own
    /// outcome wins over anything that goes wrong here.
    async fn settle_router(&self, key: &str) {
        if let Err(e) = self.stop_router_if_idle().await {
            warn!("Router cleanup after start of {}: {}", key, e);
        }
    }

    /// Undo the count of a project that is no longer running.
    async fn release(&self, key: &str, was_counted: bool) -> FleetResult<()> {
        self.router_config.set_active(key, false).await?;
        if was_counted {
            self.store.decrement_active_projects().await?;
        }
        self.stop_router_if_idle().await?;
        Ok(())
    }

    /// Delete a project's base directory unless it would take more with it.
    fn remove_base_dir(&self, dir: &Path) -> FleetResult<Option<PathBuf>> {
        if self.config.projects_root.starts_with(dir) || self.config.home.starts_with(dir) {
            warn!("Refusing to delete {}", dir.display());
            return Ok(None);
        }
        if !dir.exists() {
            return Ok(None);
        }
        std::fs::remove_dir_all(dir).map_err(|e| FleetError::Io {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        info!("Removed {}", dir.display());
        Ok(Some(dir.to_path_buf()))
    }
}
