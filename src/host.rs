use anyhow::{anyhow, Context, Result};
use ssh2::{ExtendedData, Session, Sftp};
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use crate::topology::RoleSet;

/// Short timeout for liveness probing and session setup.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Long timeout so package installs and playbook runs can finish.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

const NOT_INSTALLED: &str = "(Not installed)";

/// Classified reasons a connection attempt can fail. All of these are
/// recoverable by correcting the host entry and probing again.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("the host does not accept password logins; ask the host administrator to enable them")]
    BadAuthType,

    #[error("authentication failed; check the username and password")]
    AuthFailed,

    #[error("unable to reach the host over SSH: {0}")]
    SshProtocol(String),

    #[error("the connection to the host timed out")]
    ConnectTimeout,

    #[error("the host address could not be resolved")]
    AddressResolution,
}

fn classify_io(err: &std::io::Error) -> ConnectError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            ConnectError::ConnectTimeout
        }
        _ => ConnectError::SshProtocol(err.to_string()),
    }
}

/// Ordered diagnostic entries surfaced to the caller as `label : value`
/// lines. An invalid host carries exactly one `Invalid` entry.
#[derive(Debug, Clone, Default)]
pub struct HostReport {
    entries: Vec<(String, String)>,
}

impl HostReport {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn set(&mut self, label: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(key, _)| key == label) {
            entry.1 = value;
        } else {
            self.entries.push((label.to_string(), value));
        }
    }

    pub fn set_invalid(&mut self, reason: impl Into<String>) {
        self.entries.clear();
        self.entries.push(("Invalid".to_string(), reason.into()));
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == label)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| format!("{key:>10} : {value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Exit code and drained combined output of a remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live remote command whose output is tailed line by line. The exit code
/// becomes available from `finish` once the stream has been drained.
pub struct CommandStream {
    channel: ssh2::Channel,
}

impl CommandStream {
    pub fn stream_lines(&mut self, mut on_line: impl FnMut(&str)) -> Result<()> {
        let mut reader = BufReader::new(&mut self.channel);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .context("failed reading remote command output")?;
            if read == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            on_line(line.trim_end_matches(['\r', '\n']));
        }
        Ok(())
    }

    pub fn finish(mut self) -> i32 {
        self.channel.wait_close().ok();
        self.channel.exit_status().unwrap_or(-1)
    }
}

struct SessionHandle {
    session: Session,
    sftp: Sftp,
}

/// One remote machine and its lazily opened SSH/SFTP session.
///
/// Edits follow copy-then-commit: build a fresh value and let
/// `ClusterTopology::upsert_host` perform the swap.
pub struct RemoteHost {
    address: String,
    ssh_port: u16,
    username: String,
    password: String,
    note: String,
    roles: RoleSet,
    valid: bool,
    report: HostReport,
    session: Option<SessionHandle>,
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("address", &self.address)
            .field("ssh_port", &self.ssh_port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("note", &self.note)
            .field("roles", &self.roles)
            .field("valid", &self.valid)
            .field("connected", &self.session.is_some())
            .finish()
    }
}

impl RemoteHost {
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        ssh_port: u16,
        note: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            ssh_port,
            username: username.into(),
            password: password.into(),
            note: note.into(),
            roles: RoleSet::default(),
            valid: false,
            report: HostReport::default(),
            session: None,
        }
    }

    pub fn with_roles(mut self, roles: RoleSet) -> Self {
        self.roles = roles;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    pub fn roles(&self) -> RoleSet {
        self.roles
    }

    pub fn set_roles(&mut self, roles: RoleSet) {
        self.roles = roles;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn report(&self) -> &HostReport {
        &self.report
    }

    /// Host list label: `address(note)`, bare address, or `new-host` for an
    /// entry with no address yet.
    pub fn describe(&self) -> String {
        if self.address.is_empty() {
            return "new-host".to_string();
        }
        if self.note.is_empty() {
            self.address.clone()
        } else {
            format!("{}({})", self.address, self.note)
        }
    }

    /// Establishes the SSH session and SFTP channel, classifying any failure.
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        let addr = format!("{}:{}", self.address, self.ssh_port)
            .to_socket_addrs()
            .map_err(|_| ConnectError::AddressResolution)?
            .next()
            .ok_or(ConnectError::AddressResolution)?;
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|err| classify_io(&err))?;
        tcp.set_read_timeout(Some(COMMAND_TIMEOUT)).ok();
        tcp.set_write_timeout(Some(COMMAND_TIMEOUT)).ok();

        let mut session =
            Session::new().map_err(|err| ConnectError::SshProtocol(err.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
        session
            .handshake()
            .map_err(|err| ConnectError::SshProtocol(err.to_string()))?;

        let methods = session
            .auth_methods(&self.username)
            .map_err(|err| ConnectError::SshProtocol(err.to_string()))?;
        if !methods.split(',').any(|method| method.trim() == "password") {
            return Err(ConnectError::BadAuthType);
        }
        session
            .userauth_password(&self.username, &self.password)
            .map_err(|_| ConnectError::AuthFailed)?;
        if !session.authenticated() {
            return Err(ConnectError::AuthFailed);
        }

        let sftp = session
            .sftp()
            .map_err(|err| ConnectError::SshProtocol(err.to_string()))?;
        self.session = Some(SessionHandle { session, sftp });
        Ok(())
    }

    /// Reconnects and refreshes the diagnostic report. A classified
    /// connection failure or an unaccepted OS leaves the host invalid with a
    /// single descriptive `Invalid` entry; neither propagates as an error.
    pub fn probe(&mut self) -> bool {
        self.close();
        self.report.clear();
        self.valid = false;

        if let Err(err) = self.connect() {
            tracing::error!(host = %self.address, error = %err, "connect failed");
            self.report.set_invalid(err.to_string());
            return false;
        }
        match self.gather_facts() {
            Ok(accepted) => self.valid = accepted,
            Err(err) => {
                tracing::error!(host = %self.address, error = %err, "host inspection failed");
                self.report
                    .set_invalid(format!("failed to inspect the host: {err:#}"));
            }
        }
        self.valid
    }

    fn gather_facts(&mut self) -> Result<bool> {
        let release = self.exec("cat /etc/centos-release")?;
        let Some(os) = accepted_os(&release.output) else {
            self.report.set_invalid("CentOS 7 is required on every cluster host");
            return Ok(false);
        };
        self.report.set("OS", os);

        let hostname = self.exec("hostname")?;
        if let Some(name) = hostname.output.lines().next() {
            self.report.set("Hostname", name.trim());
        }
        let cpuinfo = self.exec("cat /proc/cpuinfo")?;
        if let Some(cpu) = parse_cpu_info(&cpuinfo.output) {
            self.report.set("CPU", cpu);
        }
        let meminfo = self.exec("cat /proc/meminfo")?;
        if let Some(memory) = parse_mem_total(&meminfo.output) {
            self.report.set("Memory", memory);
        }
        let docker = self.exec("docker version")?;
        self.report.set(
            "Docker",
            parse_docker_version(&docker.output).unwrap_or_else(|| NOT_INSTALLED.to_string()),
        );
        Ok(true)
    }

    fn ensure_session(&mut self) -> Result<&mut SessionHandle, ConnectError> {
        if self.session.is_none() {
            self.connect()?;
        }
        self.session
            .as_mut()
            .ok_or_else(|| ConnectError::SshProtocol("session unavailable".to_string()))
    }

    fn open_channel(&mut self, command: &str) -> Result<ssh2::Channel> {
        let handle = self.ensure_session()?;
        handle
            .session
            .set_timeout(COMMAND_TIMEOUT.as_millis() as u32);
        let mut channel = handle
            .session
            .channel_session()
            .context("failed to open SSH channel")?;
        // One interleaved stream, so callers can tail stdout and stderr live.
        channel
            .handle_extended_data(ExtendedData::Merge)
            .context("failed to merge remote output streams")?;
        channel
            .exec(command)
            .with_context(|| format!("failed to exec `{command}`"))?;
        Ok(channel)
    }

    /// Runs a command to completion and returns its exit code with the
    /// drained combined output. Opens a session if none exists. Blocking.
    pub fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        let mut channel = self.open_channel(command)?;
        let mut output = String::new();
        channel.read_to_string(&mut output).ok();
        channel.wait_close().ok();
        let exit_code = channel.exit_status().unwrap_or(-1);
        tracing::debug!(host = %self.address, command, exit_code, "exec");
        Ok(ExecOutput { exit_code, output })
    }

    /// Like `exec`, but returns the live stream for long-running commands
    /// whose output is tailed as it arrives.
    pub fn exec_streamed(&mut self, command: &str) -> Result<CommandStream> {
        let channel = self.open_channel(command)?;
        tracing::debug!(host = %self.address, command, "exec streamed");
        Ok(CommandStream { channel })
    }

    /// SFTP upload with an optional `(transferred, total)` progress callback.
    pub fn upload(
        &mut self,
        local: &Path,
        remote: &Path,
        mut progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<()> {
        let mut file = fs::File::open(local)
            .with_context(|| format!("failed to open {}", local.display()))?;
        let total = file.metadata().map(|meta| meta.len()).unwrap_or(0);

        let handle = self.ensure_session()?;
        handle
            .session
            .set_timeout(COMMAND_TIMEOUT.as_millis() as u32);
        let mut remote_file = handle
            .sftp
            .create(remote)
            .with_context(|| format!("failed to create remote file {}", remote.display()))?;

        let mut transferred = 0u64;
        let mut chunk = [0u8; 32 * 1024];
        loop {
            let read = file
                .read(&mut chunk)
                .with_context(|| format!("failed reading {}", local.display()))?;
            if read == 0 {
                break;
            }
            remote_file
                .write_all(&chunk[..read])
                .context("failed writing remote file")?;
            transferred += read as u64;
            if let Some(callback) = progress.as_deref_mut() {
                callback(transferred, total);
            }
        }
        Ok(())
    }

    /// SFTP download with an optional `(transferred, total)` progress callback.
    pub fn download(
        &mut self,
        remote: &Path,
        local: &Path,
        mut progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<()> {
        let handle = self.ensure_session()?;
        handle
            .session
            .set_timeout(COMMAND_TIMEOUT.as_millis() as u32);
        let mut remote_file = handle
            .sftp
            .open(remote)
            .with_context(|| format!("failed to open remote file {}", remote.display()))?;
        let total = remote_file
            .stat()
            .ok()
            .and_then(|stat| stat.size)
            .unwrap_or(0);

        let mut file = fs::File::create(local)
            .with_context(|| format!("failed to create {}", local.display()))?;
        let mut transferred = 0u64;
        let mut chunk = [0u8; 32 * 1024];
        loop {
            let read = remote_file
                .read(&mut chunk)
                .context("failed reading remote file")?;
            if read == 0 {
                break;
            }
            file.write_all(&chunk[..read])
                .with_context(|| format!("failed writing {}", local.display()))?;
            transferred += read as u64;
            if let Some(callback) = progress.as_deref_mut() {
                callback(transferred, total);
            }
        }
        Ok(())
    }

    /// Uploads a local archive to `/tmp` on the host, then streams a shell
    /// pipeline that recreates `remote_dir` and extracts the archive into it,
    /// removing the staged file afterwards. The caller inspects the stream's
    /// exit code.
    pub fn unarchive(
        &mut self,
        local_archive: &Path,
        remote_dir: &str,
        progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<CommandStream> {
        let file_name = local_archive
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                anyhow!("archive path has no file name: {}", local_archive.display())
            })?;
        let staged = format!("/tmp/{file_name}");
        self.upload(local_archive, Path::new(&staged), progress)?;

        let target = self.resolve_home_path(remote_dir);
        let command = format!(
            "rm -rf {target} && mkdir -p {target} && tar xzvf {staged} -C {target} && rm -f {staged}"
        );
        self.exec_streamed(&command)
    }

    /// Expands a leading `~` to this account's home directory; other paths
    /// are returned unchanged.
    pub fn resolve_home_path(&self, path: &str) -> String {
        let Some(rest) = path.strip_prefix('~') else {
            return path.to_string();
        };
        if self.username == "root" {
            format!("/root{rest}")
        } else {
            format!("/home/{}{rest}", self.username)
        }
    }

    /// Releases SFTP and SSH session resources; idempotent.
    pub fn close(&mut self) {
        if let Some(handle) = self.session.take() {
            drop(handle.sftp);
            handle.session.disconnect(None, "closing", None).ok();
        }
    }
}

/// Probes a host on the blocking pool so the caller's event loop stays free;
/// probing touches no pipeline state.
pub fn spawn_probe(mut host: RemoteHost) -> tokio::task::JoinHandle<RemoteHost> {
    tokio::task::spawn_blocking(move || {
        host.probe();
        host
    })
}

fn accepted_os(release: &str) -> Option<String> {
    let line = release.lines().next()?.trim();
    if line.contains("CentOS Linux release 7") {
        Some(line.replace("Linux release ", ""))
    } else {
        None
    }
}

fn parse_cpu_info(cpuinfo: &str) -> Option<String> {
    let mut count = 0usize;
    let mut model = None;
    for line in cpuinfo.lines() {
        if line.starts_with("processor") {
            count += 1;
        }
        if model.is_none() && line.starts_with("model name") {
            let raw = line.split(':').nth(1)?.trim();
            let tokens: Vec<&str> = raw.split_whitespace().collect();
            model = Some(if tokens.len() >= 3 {
                format!("{} {} {}", tokens[0], tokens[2], tokens[tokens.len() - 1])
            } else {
                raw.to_string()
            });
        }
    }
    if count == 0 {
        return None;
    }
    Some(format!("{} x {count}", model.unwrap_or_else(|| "unknown".to_string())))
}

fn parse_mem_total(meminfo: &str) -> Option<String> {
    for line in meminfo.lines() {
        if line.starts_with("MemTotal") {
            let kilobytes: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
            return Some(format!("{:.0} MB", kilobytes / 1024.0));
        }
    }
    None
}

fn parse_docker_version(output: &str) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim_start();
        if let Some(version) = trimmed.strip_prefix("Version:") {
            return Some(version.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Role;

    #[test]
    fn resolve_home_path_expands_for_root() {
        let host = RemoteHost::new("10.0.0.1", "root", "pw", 22, "");
        assert_eq!(host.resolve_home_path("~/.trustchain"), "/root/.trustchain");
    }

    #[test]
    fn resolve_home_path_expands_for_other_users() {
        let host = RemoteHost::new("10.0.0.1", "alice", "pw", 22, "");
        assert_eq!(
            host.resolve_home_path("~/.trustchain"),
            "/home/alice/.trustchain"
        );
    }

    #[test]
    fn resolve_home_path_leaves_absolute_paths_alone() {
        let host = RemoteHost::new("10.0.0.1", "root", "pw", 22, "");
        assert_eq!(host.resolve_home_path("/opt/data"), "/opt/data");
    }

    #[test]
    fn describe_uses_note_when_present() {
        assert_eq!(
            RemoteHost::new("10.0.0.1", "root", "pw", 22, "ops").describe(),
            "10.0.0.1(ops)"
        );
        assert_eq!(
            RemoteHost::new("10.0.0.1", "root", "pw", 22, "").describe(),
            "10.0.0.1"
        );
        assert_eq!(RemoteHost::new("", "root", "pw", 22, "").describe(), "new-host");
    }

    #[test]
    fn debug_redacts_the_password() {
        let host = RemoteHost::new("10.0.0.1", "root", "hunter2", 22, "");
        let rendered = format!("{host:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn report_keeps_insertion_order_and_replaces_in_place() {
        let mut report = HostReport::default();
        report.set("OS", "CentOS 7.9");
        report.set("Hostname", "node-1");
        report.set("OS", "CentOS 7.6");

        let labels: Vec<&str> = report.entries().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(labels, vec!["OS", "Hostname"]);
        assert_eq!(report.get("OS"), Some("CentOS 7.6"));
    }

    #[test]
    fn invalid_report_has_a_single_entry() {
        let mut report = HostReport::default();
        report.set("OS", "CentOS 7.9");
        report.set_invalid("authentication failed");
        assert_eq!(report.entries().len(), 1);
        assert_eq!(report.get("Invalid"), Some("authentication failed"));
        assert!(report.render().contains("Invalid : authentication failed"));
    }

    #[test]
    fn accepted_os_gates_on_centos_7() {
        let os = accepted_os("CentOS Linux release 7.9.2009 (Core)\n");
        assert_eq!(os.as_deref(), Some("CentOS 7.9.2009 (Core)"));
        assert!(accepted_os("Ubuntu 22.04.3 LTS\n").is_none());
        assert!(accepted_os("CentOS Linux release 8.5.2111\n").is_none());
    }

    #[test]
    fn parse_cpu_info_condenses_the_model_and_counts_processors() {
        let cpuinfo = "processor\t: 0\n\
                       model name\t: Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz\n\
                       processor\t: 1\n\
                       model name\t: Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz\n";
        assert_eq!(
            parse_cpu_info(cpuinfo).as_deref(),
            Some("Intel(R) CPU 2.40GHz x 2")
        );
        assert!(parse_cpu_info("").is_none());
    }

    #[test]
    fn parse_mem_total_converts_to_megabytes() {
        let meminfo = "MemTotal:        8167324 kB\nMemFree:         1651558 kB\n";
        assert_eq!(parse_mem_total(meminfo).as_deref(), Some("7976 MB"));
    }

    #[test]
    fn parse_docker_version_reads_the_client_section() {
        let output = "Client: Docker Engine - Community\n  Version:           24.0.7\n  API version:       1.43\n";
        assert_eq!(parse_docker_version(output).as_deref(), Some("24.0.7"));
        assert!(parse_docker_version("docker: command not found\n").is_none());
    }

    #[test]
    fn classify_io_maps_timeouts() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert!(matches!(classify_io(&timeout), ConnectError::ConnectTimeout));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(classify_io(&refused), ConnectError::SshProtocol(_)));
    }

    #[test]
    fn close_is_idempotent_without_a_session() {
        let mut host = RemoteHost::new("10.0.0.1", "root", "pw", 22, "");
        host.close();
        host.close();
        assert!(!host.is_valid());
    }

    #[test]
    fn with_roles_attaches_the_role_set() {
        let host = RemoteHost::new("10.0.0.1", "root", "pw", 22, "")
            .with_roles([Role::Validator, Role::OpsMaster].into_iter().collect());
        assert!(host.roles().contains(Role::Validator));
        assert!(host.roles().contains(Role::OpsMaster));
        assert!(!host.roles().contains(Role::Explorer));
    }
}
