// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared router lifecycle.
//!
//! The router runs exactly while at least one project is active. Its port is
//! sticky: once chosen it is persisted and reused on every later start.

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::project::observe;
use super::types::RouterReport;
use super::Orchestrator;
use crate::config::expand_args;
use crate::error::{FleetError, FleetResult};
use crate::persist;
use crate::process::{ProcessError, SpawnRequest};
use crate::state::{GlobalRouterState, RouterStatus, StateError};

/// Move the router record to IDLE from wherever it is.
fn settle_idle(router: &mut GlobalRouterState) -> Result<(), StateError> {
    if matches!(router.status, RouterStatus::Starting | RouterStatus::Running) {
        router.status = router.status.transition(RouterStatus::Failed)?;
    }
    router.status = router.status.transition(RouterStatus::Idle)?;
    router.pid = None;
    Ok(())
}

impl Orchestrator {
    /// Make sure the router runs if any project is active.
    ///
    /// A live router recorded as anything but RUNNING is corrected to
    /// RUNNING. With no active projects the router is left idle.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn ensure_router_running(&self) -> FleetResult<GlobalRouterState> {
        let started = Instant::now();
        let _guard = self.router_lock.lock().await;
        let result = self.ensure_router_locked().await;
        observe("router.ensure", started, &result);
        result
    }

    /// Stop the router. Refused while projects are active.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn stop_router(&self) -> FleetResult<GlobalRouterState> {
        let _guard = self.router_lock.lock().await;
        let state = self.store.get_router_state().await?;
        if state.active_project_count > 0 {
            return Err(FleetError::RouterBusy(state.active_project_count));
        }
        self.stop_router_locked().await?;
        Ok(self.store.get_router_state().await?)
    }

    /// Stop the router and start it again on the same port when projects are
    /// active; otherwise leave it idle.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn restart_router(&self) -> FleetResult<GlobalRouterState> {
        let started = Instant::now();
        let _guard = self.router_lock.lock().await;
        let result = async {
            self.stop_router_locked().await?;
            self.ensure_router_locked().await
        }
        .await;
        observe("router.restart", started, &result);
        result
    }

    /// Recorded router state plus a live check.
    pub async fn router_status(&self) -> FleetResult<RouterReport> {
        let _guard = self.router_lock.lock().await;
        let mut state = self.store.get_router_state().await?;
        let alive = state.pid.is_some_and(|pid| self.supervisor.is_running(pid));
        let url = state.port.map(|port| self.router_url(port));

        let health = match (alive, state.port) {
            (true, Some(port)) => {
                let health_url = format!("{}{}", self.router_url(port), self.config.router.health_path);
                let report = self.supervisor.probe(&health_url, &self.router_auth()).await;
                if report.healthy {
                    state = self
                        .store
                        .update_router_state(|r| {
                            r.last_health_check = Some(Utc::now());
                            Ok(r.clone())
                        })
                        .await?;
                }
                Some(report)
            }
            _ => None,
        };

        Ok(RouterReport {
            state,
            alive,
            url,
            health,
        })
    }

    /// Stop the router if no project is active. Returns whether it was stopped.
    pub(super) async fn stop_router_if_idle(&self) -> FleetResult<bool> {
        let _guard = self.router_lock.lock().await;
        let state = self.store.get_router_state().await?;
        if state.active_project_count > 0 {
            return Ok(false);
        }
        self.stop_router_locked().await
    }

    async fn ensure_router_locked(&self) -> FleetResult<GlobalRouterState> {
        let state = self.store.get_router_state().await?;

        if let Some(pid) = state.pid.filter(|pid| self.supervisor.is_running(*pid)) {
            if state.status == RouterStatus::Running {
                debug!(pid, "Router already running");
                return Ok(state);
            }
            warn!(pid, "Router is alive but recorded {}; correcting to running", state.status);
            let corrected = self
                .store
                .update_router_state(|r| {
                    // Drift correction, not a lifecycle step.
                    r.status = RouterStatus::Running;
                    r.last_error = None;
                    Ok(r.clone())
                })
                .await?;
            return Ok(corrected);
        }

        if state.active_project_count == 0 {
            debug!("No active projects; router stays idle");
            if state.status == RouterStatus::Idle && state.pid.is_none() {
                return Ok(state);
            }
            let settled = self
                .store
                .update_router_state(|r| {
                    settle_idle(r)?;
                    Ok(r.clone())
                })
                .await?;
            return Ok(settled);
        }

        self.spawn_router(state).await
    }

    async fn spawn_router(&self, state: GlobalRouterState) -> FleetResult<GlobalRouterState> {
        let router = &self.config.router;
        let port = state.port.unwrap_or(router.default_port);
        let previous = state.pid;

        self.store
            .update_router_state(|r| {
                if matches!(r.status, RouterStatus::Running | RouterStatus::Stopping) {
                    r.status = r.status.transition(RouterStatus::Failed)?;
                }
                r.status = r.status.transition(RouterStatus::Starting)?;
                r.pid = None;
                r.port = Some(port);
                r.last_error = None;
                Ok(())
            })
            .await?;
        if let Some(pid) = previous {
            debug!(pid, "Previous router process is gone");
        }

        if !self.supervisor.port_is_free(port) {
            let killed = self
                .supervisor
                .kill_process_on_port(port, self.config.timeouts.terminate_timeout())
                .await;
            if !killed.is_empty() {
                warn!(port, ?killed, "Killed stale listener on router port");
                #[cfg(feature = "telemetry")]
                crate::telemetry::metrics::increment(crate::telemetry::Counter::StalePortKill);
            }
            if !self.supervisor.port_is_free(port) {
                return Err(self.router_failed(ProcessError::PortInUse(port)).await);
            }
        }

        if !self.supervisor.binary_exists(&router.command) {
            return Err(self
                .router_failed(ProcessError::BinaryNotFound(router.command.clone()))
                .await);
        }

        if let Err(e) = persist::ensure_private_dir(&self.config.home) {
            return Err(self.router_failed(ProcessError::Io(e)).await);
        }

        let mut env = router.env.clone();
        env.insert(
            router.config_path_env.clone(),
            self.router_config.path().display().to_string(),
        );
        env.insert(router.token_env.clone(), self.secrets.router_token.clone());
        let request = SpawnRequest {
            program: router.command.clone(),
            args: expand_args(&router.args, port, &router.hostname),
            env,
            cwd: self.config.home.clone(),
            log_file: self.log_path("router"),
            port,
            signature: format!("--port {}", port),
        };

        info!(port, "Starting router: {}", request.command_line());
        let pid = match self.supervisor.spawn(request).await {
            Ok(pid) => pid,
            Err(e) => return Err(self.router_failed(e).await),
        };
        #[cfg(feature = "telemetry")]
        crate::telemetry::metrics::increment(crate::telemetry::Counter::Spawn);
        self.store
            .update_router_state(|r| {
                r.pid = Some(pid);
                Ok(())
            })
            .await?;

        let timeouts = &self.config.timeouts;
        let url = format!("{}{}", self.router_url(port), router.health_path);
        let report = self
            .supervisor
            .health_check(
                &url,
                &self.router_auth(),
                timeouts.health_timeout(),
                timeouts.health_interval(),
            )
            .await;
        if !report.healthy {
            #[cfg(feature = "telemetry")]
            crate::telemetry::metrics::increment(crate::telemetry::Counter::HealthFailure);
            if let Err(e) = self.supervisor.terminate(pid, timeouts.terminate_timeout()).await {
                warn!(pid, "Failed to stop unhealthy router: {}", e);
            }
            return Err(self
                .router_failed(ProcessError::HealthTimeout {
                    url,
                    elapsed_ms: report.elapsed_ms,
                    last_message: report.message,
                })
                .await);
        }

        let running = self
            .store
            .update_router_state(|r| {
                r.status = r.status.transition(RouterStatus::Running)?;
                r.last_health_check = Some(Utc::now());
                Ok(r.clone())
            })
            .await?;
        info!(pid, port, "Router running");
        Ok(running)
    }

    /// Record a failed router start and build the error to return.
    async fn router_failed(&self, err: ProcessError) -> FleetError {
        warn!("Router start failed: {}", err);
        let message = err.to_string();
        let recorded = self
            .store
            .update_router_state(|r| {
                r.status = r.status.transition(RouterStatus::Failed)?;
                r.pid = None;
                r.last_error = Some(message);
                Ok(())
            })
            .await;
        match recorded {
            Ok(()) => err.into(),
            Err(e) => e.into(),
        }
    }

    /// Terminate the router if it runs and record IDLE.
    async fn stop_router_locked(&self) -> FleetResult<bool> {
        let state = self.store.get_router_state().await?;
        let pid = state.pid.filter(|pid| self.supervisor.is_running(*pid));
        if pid.is_none() && state.status == RouterStatus::Idle && state.pid.is_none() {
            return Ok(false);
        }

        if state.status == RouterStatus::Running {
            self.store
                .update_router_state(|r| {
                    r.status = r.status.transition(RouterStatus::Stopping)?;
                    Ok(())
                })
                .await?;
        }

        if let Some(pid) = pid {
            info!(pid, "Stopping router");
            match self
                .supervisor
                .terminate(pid, self.config.timeouts.terminate_timeout())
                .await
            {
                Ok(escalated) => {
                    if escalated {
                        warn!(pid, "Router needed SIGKILL");
                        #[cfg(feature = "telemetry")]
                        crate::telemetry::metrics::increment(crate::telemetry::Counter::KillEscalation);
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    self.store
                        .update_router_state(|r| {
                            if r.status.can_transition_to(RouterStatus::Failed) {
                                r.status = RouterStatus::Failed;
                            }
                            r.last_error = Some(message);
                            Ok(())
                        })
                        .await?;
                    return Err(e.into());
                }
            }
        }

        self.store.update_router_state(settle_idle).await?;
        info!("Router idle");
        Ok(pid.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_idle_from_every_state() {
        for status in [
            RouterStatus::Idle,
            RouterStatus::Starting,
            RouterStatus::Running,
            RouterStatus::Stopping,
            RouterStatus::Failed,
        ] {
            let mut router = GlobalRouterState {
                status,
                pid: Some(42),
                ..Default::default()
            };
            settle_idle(&mut router).unwrap();
            assert_eq!(router.status, RouterStatus::Idle);
            assert!(router.pid.is_none());
        }
    }
}
