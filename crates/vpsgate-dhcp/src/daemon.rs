use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use vpsgate_core::config::DhcpSettings;
use vpsgate_core::error::{Error, Result};

/// How many times to probe the daemon's DNS port after spawn.
const PROBE_ATTEMPTS: u32 = 20;
const PROBE_DELAY: Duration = Duration::from_millis(250);

/// Supervises the dnsmasq subprocess: generated config, foreground spawn,
/// liveness probe, SIGHUP reload, restart on failure.
pub struct DnsmasqDaemon {
    settings: DhcpSettings,
    zone: String,
    child: Mutex<Option<Child>>,
}

impl DnsmasqDaemon {
    pub fn new(settings: DhcpSettings, zone: impl Into<String>) -> Self {
        Self {
            settings,
            zone: zone.into(),
            child: Mutex::new(None),
        }
    }

    /// Render the generated dnsmasq configuration, one directive per line.
    pub fn render_config(&self) -> String {
        let s = &self.settings;
        let listen = s.listen_ip.unwrap_or(s.gateway_ip);
        let dns_csv = s
            .dns_servers
            .iter()
            .map(Ipv4Addr::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut out = String::new();
        out.push_str("user=root\n");
        out.push_str(&format!("interface={}\n", s.interface));
        out.push_str(&format!("listen-address={listen}\n"));
        out.push_str("listen-address=127.0.0.1\n");
        out.push_str("port=53\n");
        out.push_str(&format!("domain={}\n", self.zone));
        out.push_str("expand-hosts\n");
        out.push_str(&format!("local=/{}/\n", self.zone));
        out.push_str(&format!("addn-hosts={}\n", s.host_file().display()));
        out.push_str("dhcp-authoritative\n");
        out.push_str("dhcp-ignore-names\n");
        out.push_str(&format!(
            "dhcp-range={},{},{},12h\n",
            s.pool_start, s.pool_end, s.subnet_mask
        ));
        out.push_str(&format!("dhcp-option=option:router,{}\n", s.gateway_ip));
        out.push_str(&format!("server={}\n", s.dns_servers[0]));
        out.push_str(&format!("dhcp-option=6,{dns_csv}\n"));
        out.push_str(&format!("dhcp-hostsfile={}\n", s.host_file().display()));
        out.push_str(&format!("dhcp-leasefile={}\n", s.lease_file().display()));
        out.push_str("log-dhcp\n");
        out.push_str("log-queries\n");
        out
    }

    /// Write the generated config and spawn dnsmasq in the foreground.
    /// Fatal if the spawn or the post-spawn liveness probe fails.
    pub async fn start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.settings.lease_dir).await?;

        let conf_path = self.settings.daemon_config_file();
        tokio::fs::write(&conf_path, self.render_config()).await?;

        // The daemon refuses to start if the hosts file is missing.
        let host_file = self.settings.host_file();
        if !host_file.exists() {
            tokio::fs::write(&host_file, "").await?;
        }

        let mut child = Command::new("dnsmasq")
            .arg("--keep-in-foreground")
            .arg("--conf-file")
            .arg(&conf_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Config(format!("failed to spawn dnsmasq: {e}")))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, "stderr"));
        }

        let pid = child.id();
        *self.child.lock().await = Some(child);
        info!(pid = ?pid, "dnsmasq started");

        self.verify_listening().await
    }

    /// Probe the DNS port on loopback and on the configured listen address
    /// within a bounded retry budget.
    async fn verify_listening(&self) -> Result<()> {
        let listen = self.settings.listen_ip.unwrap_or(self.settings.gateway_ip);
        for attempt in 1..=PROBE_ATTEMPTS {
            let loopback = TcpStream::connect(("127.0.0.1", 53)).await;
            let bound = TcpStream::connect((listen, 53)).await;
            match (loopback, bound) {
                (Ok(_), Ok(_)) => {
                    debug!(attempt, "dnsmasq answering on port 53");
                    return Ok(());
                }
                (l, b) => {
                    debug!(attempt, loopback_ok = l.is_ok(), bound_ok = b.is_ok(), "dnsmasq not ready");
                }
            }
            tokio::time::sleep(PROBE_DELAY).await;
        }
        Err(Error::Config(format!(
            "dnsmasq did not start listening on 127.0.0.1:53 and {listen}:53"
        )))
    }

    /// Ask the daemon to re-read its host file. SIGHUP to the recorded PID;
    /// if the PID is lost, signal by process name; if that fails too,
    /// restart the daemon.
    pub async fn reload(&self) {
        let pid = {
            let guard = self.child.lock().await;
            guard.as_ref().and_then(|c| c.id())
        };

        let signalled = match pid {
            Some(pid) => match kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                Ok(()) => true,
                Err(e) => {
                    warn!(pid, error = %e, "SIGHUP to dnsmasq failed");
                    false
                }
            },
            None => false,
        };

        if signalled {
            return;
        }

        // PID lost or signal failed: try by process name.
        let by_name = Command::new("pkill")
            .args(["-HUP", "-x", "dnsmasq"])
            .status()
            .await;
        match by_name {
            Ok(status) if status.success() => {
                debug!("dnsmasq reloaded via pkill");
            }
            other => {
                warn!(result = ?other, "dnsmasq reload failed, restarting daemon");
                if let Err(e) = self.restart().await {
                    error!(error = %e, "dnsmasq restart failed");
                }
            }
        }
    }

    /// Terminate the current child (if any) and start a fresh one.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    /// SIGTERM the child and reap it.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        }
    }

    /// Supervision loop: restart the daemon if it exits unexpectedly.
    pub async fn monitor(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut shutdown = shutdown;
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let exited = {
                        let mut guard = self.child.lock().await;
                        match guard.as_mut() {
                            Some(child) => match child.try_wait() {
                                Ok(Some(status)) => {
                                    guard.take();
                                    Some(status)
                                }
                                Ok(None) => None,
                                Err(e) => {
                                    warn!(error = %e, "failed to poll dnsmasq");
                                    None
                                }
                            },
                            None => None,
                        }
                    };
                    if let Some(status) = exited {
                        warn!(%status, "dnsmasq exited unexpectedly, restarting");
                        if let Err(e) = self.start().await {
                            error!(error = %e, "dnsmasq restart failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("daemon monitor shutting down");
                        self.stop().await;
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn pump_output<R: tokio::io::AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "dnsmasq", stream, "{line}");
    }
}
