// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! The hypervisor-side domain manager (C5): creates, destroys and bootstraps
//! libvirt guests on request from a remote-virt provisioner.
//!
//! Grounded on `original_source/vurm/provisioners/remotevirt/remote.py`'s
//! `DomainManager`. The libvirt FFI and process exec/wait calls are blocking,
//! so they always run via [`tokio::task::spawn_blocking`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use russh::client::{self, Handle};
use russh_keys::key::KeyPair;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};

use crate::agent_rpc::agent_server::Agent;
use crate::agent_rpc::{
    CreateDomainReply, CreateDomainRequest, DestroyDomainReply, DestroyDomainRequest,
    SpawnSlurmDaemonReply, SpawnSlurmDaemonRequest,
};
use crate::config::VurmdLibvirtSection;
use crate::error::{Error, Result};

const IP_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);
const IP_EXCHANGE_DELAY: Duration = Duration::from_secs(1);

/// Runs on a hypervisor host; one instance per `vurmd-libvirt` process.
pub struct DomainManager {
    config: VurmdLibvirtSection,
    addresses: Mutex<HashMap<String, String>>,
}

impl DomainManager {
    pub fn new(config: VurmdLibvirtSection) -> Self {
        Self {
            config,
            addresses: Mutex::new(HashMap::new()),
        }
    }

    /// `VIR_ERR_NO_CONNECT`, the code libvirt raises when the hypervisor URI
    /// can't be reached at all, mirroring the original's `code() == 38` check.
    const VIR_ERR_NO_CONNECT: i32 = 38;

    fn open_hypervisor(hypervisor: &str) -> Result<virt::connect::Connect> {
        virt::connect::Connect::open(Some(hypervisor)).map_err(|e| {
            if e.code() as i32 == Self::VIR_ERR_NO_CONNECT {
                error!("could not connect to hypervisor: {}", e.message());
                Error::ConnectError(e.message())
            } else {
                Error::Libvirt(e.message())
            }
        })
    }

    /// Runs the full `CreateDomain` pipeline: clone the image, rewrite the
    /// domain description, inject a serial-to-TCP callback device, boot the
    /// guest, and wait for it to report its IP address.
    pub async fn create_domain(&self, description: String) -> Result<String> {
        info!("new virtual domain creation request received");

        let (node_name, original_image_path) = parse_domain_description(&description)?;
        let clone_image_path = self.config.clonedir.join(format!("{node_name}.qcow2"));

        info!(
            "creating new copy-on-write image based on {} at {}",
            original_image_path,
            clone_image_path.display()
        );

        let cmd = self
            .config
            .clonebin
            .replace("{source}", &original_image_path)
            .replace("{destination}", &clone_image_path.to_string_lossy());

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!("image clone failed for {node_name} (output follows)");
            debug!("stdout: {:?}", String::from_utf8_lossy(&output.stdout));
            debug!("stderr: {stderr:?}");
            return Err(Error::CloneFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let (address_rx, port) = self.exchange_address_and_key().await?;

        let description = rewrite_domain_description(
            &description,
            &clone_image_path.to_string_lossy(),
            port,
        )?;

        let hypervisor = self.config.hypervisor.clone();
        let domain_xml = description.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Self::open_hypervisor(&hypervisor)?;
            virt::domain::Domain::create_xml(&conn, &domain_xml, 0)
                .map_err(|e| Error::Libvirt(e.message()))?;
            Ok(())
        })
        .await??;

        info!("domain created, waiting for guest OS to come up");

        let hostname = tokio::time::timeout(IP_EXCHANGE_TIMEOUT, address_rx)
            .await
            .map_err(|_| Error::IpExchangeTimeout)?
            .map_err(|_| Error::IpExchangeTimeout)?;

        info!("got IP address {hostname} for domain {node_name}");

        self.addresses
            .lock()
            .await
            .insert(node_name.clone(), hostname.clone());

        Ok(hostname)
    }

    /// Listens on an ephemeral localhost port for the guest's IP-exchange
    /// callback: the guest sends one line with its address, we wait a beat
    /// for its serial console to settle, then send back our SSH public key
    /// and close.
    async fn exchange_address_and_key(
        &self,
    ) -> Result<(tokio::sync::oneshot::Receiver<String>, u16)> {
        let key = russh_keys::load_secret_key(&self.config.key, None)
            .map_err(|e| Error::Ssh(e.to_string()))?;
        let public_key_line = openssh_public_key_line(&key)?;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();

        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            // Bounded by the same timeout the caller applies to `rx`: if the
            // guest never connects, this task (and the listener it owns)
            // must not outlive the caller's wait.
            let outcome = tokio::time::timeout(IP_EXCHANGE_TIMEOUT, async move {
                let (stream, _) = listener.accept().await?;

                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();

                let address = match lines.next_line().await? {
                    Some(line) => line,
                    None => {
                        return Err(Error::Ssh(
                            "IP-exchange peer disconnected before sending an address".to_string(),
                        ))
                    }
                };

                // Give the guest time to open its serial console before we
                // reply, and ourselves time to let the key land afterwards.
                tokio::time::sleep(IP_EXCHANGE_DELAY).await;
                write_half
                    .write_all(format!("{public_key_line}\n").as_bytes())
                    .await?;
                write_half.shutdown().await?;
                tokio::time::sleep(IP_EXCHANGE_DELAY).await;

                Ok(address)
            })
            .await;

            match outcome {
                Ok(Ok(address)) => {
                    let _ = tx.send(address);
                }
                Ok(Err(e)) => error!("IP-exchange listener failed: {e}"),
                Err(_) => error!("IP-exchange listener timed out waiting for the guest"),
            }
        });

        Ok((rx, port))
    }

    /// Best-effort teardown: forgets the address, destroys the running
    /// domain if any, and removes the clone image from disk.
    pub async fn destroy_domain(&self, node_name: &str) -> Result<()> {
        info!("virtual domain destruction request for {node_name:?} received");

        if self.addresses.lock().await.remove(node_name).is_none() {
            debug!("domain {node_name:?} not found in internal registry, moving on");
        }

        let hypervisor = self.config.hypervisor.clone();
        let name = node_name.to_string();
        let destroyed = tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = Self::open_hypervisor(&hypervisor)?;
            match virt::domain::Domain::lookup_by_name(&conn, &name) {
                Ok(domain) => {
                    domain.destroy().map_err(|e| Error::Libvirt(e.message()))?;
                    Ok(true)
                }
                Err(_) => Ok(false),
            }
        })
        .await??;

        if destroyed {
            debug!("domain {node_name:?} correctly destroyed");
        } else {
            debug!("domain {node_name:?} not running, moving on");
        }

        let image = self.config.clonedir.join(format!("{node_name}.qcow2"));
        if image.exists() {
            tokio::fs::remove_file(&image).await?;
            debug!("disk image for domain {node_name:?} removed from local filesystem");
        } else {
            debug!("disk image for domain {node_name:?} not found, moving on");
        }

        Ok(())
    }

    /// Pushes the scheduler config to the guest over SFTP and starts its
    /// worker daemon over SSH.
    pub async fn spawn_daemon(&self, node_name: &str, slurm_config: Vec<u8>) -> Result<()> {
        info!("spawning worker daemon on {node_name}");

        let hostname = self
            .addresses
            .lock()
            .await
            .get(node_name)
            .cloned()
            .ok_or_else(|| Error::UnknownDomain(node_name.to_string()))?;

        let key = russh_keys::load_secret_key(&self.config.key, None)
            .map_err(|e| Error::Ssh(e.to_string()))?;

        debug!(
            "connecting over SSH to {}@{hostname} using key from {}",
            self.config.username,
            self.config.key.display()
        );

        let mut session = ssh_connect(&hostname, self.config.sshport, &self.config.username, key)
            .await?;

        let remote_slurm_conf = PathBuf::from(&self.config.slurmconfig);
        let parent = remote_slurm_conf
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        ssh_exec(&mut session, &format!("mkdir -p {parent}")).await?;
        sftp_write(&mut session, &remote_slurm_conf, &slurm_config).await?;

        let launch = self.config.slurmd.replace("{nodeName}", node_name);
        ssh_exec(&mut session, &launch).await?;

        session
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| Error::Ssh(e.to_string()))?;

        Ok(())
    }
}

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // The guest is a freshly-booted domain we just created; there is no
        // known-hosts entry to check against.
        Ok(true)
    }
}

async fn ssh_connect(
    hostname: &str,
    port: u16,
    username: &str,
    key: KeyPair,
) -> Result<Handle<ClientHandler>> {
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, (hostname, port), ClientHandler)
        .await
        .map_err(|e| Error::Ssh(e.to_string()))?;

    let authenticated = session
        .authenticate_publickey(username, Arc::new(key))
        .await
        .map_err(|e| Error::Ssh(e.to_string()))?;

    if !authenticated {
        return Err(Error::Ssh(format!("authentication rejected for {username}@{hostname}")));
    }

    Ok(session)
}

async fn ssh_exec(session: &mut Handle<ClientHandler>, command: &str) -> Result<()> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| Error::Ssh(e.to_string()))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| Error::Ssh(e.to_string()))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            russh::ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            russh::ChannelMsg::ExtendedData { ref data, .. } => stderr.extend_from_slice(data),
            russh::ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            _ => {}
        }
    }

    match exit_status {
        Some(0) => Ok(()),
        Some(code) => Err(Error::ExternalCommandFailed {
            binary: command.to_string(),
            exit_code: Some(code as i32),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }),
        None => Err(Error::ExternalCommandFailed {
            binary: command.to_string(),
            exit_code: None,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }),
    }
}

async fn sftp_write(
    session: &mut Handle<ClientHandler>,
    remote_path: &std::path::Path,
    contents: &[u8],
) -> Result<()> {
    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| Error::Ssh(e.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| Error::Ssh(e.to_string()))?;

    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| Error::Sftp(e.to_string()))?;

    let mut file = sftp
        .create(remote_path.to_string_lossy())
        .await
        .map_err(|e| Error::Sftp(e.to_string()))?;
    file.write_all(contents)
        .await
        .map_err(|e| Error::Sftp(e.to_string()))?;
    file.shutdown().await.map_err(|e| Error::Sftp(e.to_string()))?;

    sftp.close().await.map_err(|e| Error::Sftp(e.to_string()))?;
    Ok(())
}

fn openssh_public_key_line(key: &KeyPair) -> Result<String> {
    use russh_keys::PublicKeyBase64;

    let public = key.clone_public_key().map_err(|e| Error::Ssh(e.to_string()))?;
    Ok(format!("{} {}", public.name(), public.public_key_base64()))
}

/// Extracts the node name (`name` element text) and the boot disk's source
/// file path (`devices/disk[@device='disk']/source/@file`) from a domain
/// description.
fn parse_domain_description(xml: &str) -> Result<(String, String)> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut name = None;
    let mut source_path = None;
    let mut in_name = false;
    let mut in_disk_device = false;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) if e.name().as_ref() == b"name" => in_name = true,
            Event::End(e) if e.name().as_ref() == b"name" => in_name = false,
            Event::Text(t) if in_name => {
                name = Some(t.unescape()?.into_owned());
            }
            Event::Start(e) if e.name().as_ref() == b"disk" => {
                in_disk_device = e
                    .attributes()
                    .flatten()
                    .any(|a| a.key.as_ref() == b"device" && a.value.as_ref() == b"disk");
            }
            Event::End(e) if e.name().as_ref() == b"disk" => in_disk_device = false,
            Event::Empty(e) if in_disk_device && e.name().as_ref() == b"source" => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"file" {
                        source_path = Some(attr.unescape_value()?.into_owned());
                    }
                }
            }
            _ => {}
        }
    }

    let name = name.ok_or_else(|| {
        Error::InvalidDomainDescription("missing a <name> element".to_string())
    })?;
    let source_path = source_path.ok_or_else(|| {
        Error::InvalidDomainDescription("missing a disk source file".to_string())
    })?;
    Ok((name, source_path))
}

/// Rewrites the boot disk's `source/@file` to `clone_path` and injects a
/// `<serial>` device wired to `127.0.0.1:serial_port` just before the
/// `</devices>` close tag, leaving everything else byte-identical.
fn rewrite_domain_description(xml: &str, clone_path: &str, serial_port: u16) -> Result<String> {
    use quick_xml::events::{BytesStart, Event};
    use quick_xml::{Reader, Writer};

    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);
    let mut writer = Writer::new(Vec::new());

    let mut in_disk_device = false;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                if e.name().as_ref() == b"disk" {
                    in_disk_device = e
                        .attributes()
                        .flatten()
                        .any(|a| a.key.as_ref() == b"device" && a.value.as_ref() == b"disk");
                }
                writer.write_event(Event::Start(e))?;
            }
            Event::End(e) => {
                if e.name().as_ref() == b"disk" {
                    in_disk_device = false;
                }
                let is_devices_close = e.name().as_ref() == b"devices";
                if is_devices_close {
                    write_serial_device(&mut writer, serial_port)?;
                }
                writer.write_event(Event::End(e))?;
            }
            Event::Empty(e) if in_disk_device && e.name().as_ref() == b"source" => {
                let mut rewritten = BytesStart::new("source");
                rewritten.push_attribute(("file", clone_path));
                writer.write_event(Event::Empty(rewritten))?;
            }
            event => writer.write_event(event)?,
        }
    }

    Ok(String::from_utf8_lossy(writer.into_inner().as_slice()).into_owned())
}

fn write_serial_device(writer: &mut quick_xml::Writer<Vec<u8>>, port: u16) -> Result<()> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let fragment = format!(
        "<serial type=\"tcp\"><source mode=\"connect\" host=\"127.0.0.1\" service=\"{port}\"/><target port=\"0\"/><protocol type=\"raw\"/></serial>"
    );
    let mut reader = Reader::from_str(&fragment);
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            event => writer.write_event(event)?,
        }
    }
    Ok(())
}

/// Adapts [`DomainManager`] to the generated `vurm.agent.Agent` service.
pub struct AgentService {
    manager: Arc<DomainManager>,
    /// Whether internal error detail is included in the `Status` sent back
    /// to RPC callers, per the `[vurm] debug` config flag.
    debug: bool,
}

impl AgentService {
    pub fn new(manager: Arc<DomainManager>, debug: bool) -> Self {
        Self { manager, debug }
    }
}

#[tonic::async_trait]
impl Agent for AgentService {
    async fn create_domain(
        &self,
        request: Request<CreateDomainRequest>,
    ) -> std::result::Result<Response<CreateDomainReply>, Status> {
        let description = request.into_inner().description;
        let hostname = self
            .manager
            .create_domain(description)
            .await
            .map_err(|e| e.into_status(self.debug))?;
        Ok(Response::new(CreateDomainReply { hostname }))
    }

    async fn destroy_domain(
        &self,
        request: Request<DestroyDomainRequest>,
    ) -> std::result::Result<Response<DestroyDomainReply>, Status> {
        let node_name = request.into_inner().node_name;
        self.manager
            .destroy_domain(&node_name)
            .await
            .map_err(|e| e.into_status(self.debug))?;
        Ok(Response::new(DestroyDomainReply {}))
    }

    async fn spawn_slurm_daemon(
        &self,
        request: Request<SpawnSlurmDaemonRequest>,
    ) -> std::result::Result<Response<SpawnSlurmDaemonReply>, Status> {
        let request = request.into_inner();
        self.manager
            .spawn_daemon(&request.node_name, request.slurm_config)
            .await
            .map_err(|e| e.into_status(self.debug))?;
        Ok(Response::new(SpawnSlurmDaemonReply {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_disk_source() {
        let xml = r#"<domain>
            <name>nd-abc1234-0</name>
            <devices>
                <disk type="file" device="disk">
                    <source file="/images/base.qcow2"/>
                </disk>
                <disk type="file" device="cdrom">
                    <source file="/images/seed.iso"/>
                </disk>
            </devices>
        </domain>"#;

        let (name, source) = parse_domain_description(xml).unwrap();
        assert_eq!(name, "nd-abc1234-0");
        assert_eq!(source, "/images/base.qcow2");
    }

    #[test]
    fn rewrite_updates_disk_source_and_injects_serial_device() {
        let xml = r#"<domain><devices><disk type="file" device="disk"><source file="/images/base.qcow2"/></disk></devices></domain>"#;
        let rewritten = rewrite_domain_description(xml, "/clones/nd-1.qcow2", 5555).unwrap();

        assert!(rewritten.contains(r#"file="/clones/nd-1.qcow2""#));
        assert!(rewritten.contains("<serial"));
        assert!(rewritten.contains(r#"service="5555""#));
        assert!(rewritten.find("<serial").unwrap() < rewritten.find("</devices>").unwrap());
    }
}
