use std::time::Duration;

use tokio::process::Child;

/// Wait up to `grace` for the plugin to exit on its own, then ask it to
/// terminate, then kill it.
pub(crate) async fn reap(child: &mut Child, plugin: &str, grace: Duration) {
    if wait_for_exit(child, plugin, grace).await {
        return;
    }

    #[cfg(unix)]
    {
        terminate(child, plugin);
        if wait_for_exit(child, plugin, grace).await {
            return;
        }
    }

    tracing::warn!("Plugin {} did not exit, killing it", plugin);
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill plugin {}: {}", plugin, e);
    }
}

async fn wait_for_exit(child: &mut Child, plugin: &str, grace: Duration) -> bool {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!("Plugin {} exited: {}", plugin, status);
            true
        }
        Ok(Err(e)) => {
            tracing::warn!("Failed to wait for plugin {}: {}", plugin, e);
            true
        }
        Err(_) => false,
    }
}

#[cfg(unix)]
fn terminate(child: &Child, plugin: &str) {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    tracing::debug!("Sending SIGTERM to plugin {} (pid {})", plugin, pid);
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!("Failed to signal plugin {}: {}", plugin, e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{process::Stdio, time::Instant};

    use tokio::process::Command;

    use super::*;

    #[tokio::test]
    async fn exited_children_are_reaped_immediately() {
        let mut child = Command::new("sh")
            .args(["-c", "exit 0"])
            .stdin(Stdio::null())
            .spawn()
            .expect("spawn sh");
        reap(&mut child, "sh", Duration::from_secs(5)).await;
        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[tokio::test]
    async fn stubborn_children_are_terminated() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .expect("spawn sleep");

        let started = Instant::now();
        reap(&mut child, "sleep", Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(child.try_wait().expect("try_wait").is_some());
    }
}
