//! Client for the daemon's native remote protocol over its unix socket.
//!
//! Each packet is a big-endian `u32` length (including itself), a 24-byte
//! header and an XDR payload. Calls are serialised on one connection; a
//! broken connection is dropped and re-opened by the next call.

use super::xdr::{XdrReader, XdrWriter};
use super::{
    DomainInfo, DomainRecord, DomainRef, DomainStateCode, HypervisorClient, MetadataFlags,
    StorageVolumeRecord,
};
use crate::config::HypervisorConfig;
use crate::core::{Result, StoreError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

const REMOTE_PROGRAM: u32 = 0x2000_8086;
const REMOTE_PROTOCOL_VERSION: u32 = 1;
const HEADER_LEN: usize = 24;
const MAX_PACKET: usize = 32 * 1024 * 1024;

const TYPE_CALL: i32 = 0;
const TYPE_REPLY: i32 = 1;
const STATUS_OK: i32 = 0;
const STATUS_ERROR: i32 = 1;

const METADATA_ELEMENT: i32 = 2;

/// Daemon error codes the store treats as "absent" rather than failure.
pub const ERR_NO_DOMAIN: i32 = 42;
pub const ERR_NO_DOMAIN_METADATA: i32 = 80;

#[derive(Debug, Clone, Copy)]
#[repr(i32)]
enum Procedure {
    ConnectOpen = 1,
    ConnectClose = 2,
    DomainGetInfo = 16,
    DomainLookupByName = 23,
    StorageVolGetInfo = 98,
    StorageVolGetPath = 100,
    DomainSetMetadata = 264,
    DomainGetMetadata = 265,
    ConnectListAllDomains = 273,
    ConnectListAllStoragePools = 281,
    StoragePoolListAllVolumes = 282,
}

struct Connection {
    stream: UnixStream,
    serial: u32,
}

pub struct RemoteHypervisor {
    socket_path: PathBuf,
    uri: String,
    call_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl RemoteHypervisor {
    pub fn new(config: &HypervisorConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            uri: config.uri.clone(),
            call_timeout: Duration::from_millis(config.call_timeout_ms.max(1)),
            conn: Mutex::new(None),
        }
    }

    /// Sends CONNECT_CLOSE and drops the socket.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(mut conn) = guard.take() {
            let _ = exchange(&mut conn, Procedure::ConnectClose, &[]).await;
        }
        Ok(())
    }

    async fn open(&self) -> Result<Connection> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            StoreError::Unavailable(format!(
                "connect to '{}': {}",
                self.socket_path.display(),
                e
            ))
        })?;
        let mut conn = Connection { stream, serial: 0 };

        let mut args = XdrWriter::new();
        args.put_opt_string(Some(&self.uri)).put_u32(0);
        exchange(&mut conn, Procedure::ConnectOpen, &args.into_bytes()).await?;
        debug!(uri = %self.uri, "hypervisor connection opened");
        Ok(conn)
    }

    async fn call(&self, procedure: Procedure, args: XdrWriter) -> Result<Vec<u8>> {
        let payload = args.into_bytes();
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(timeout(self.call_timeout, self.open()).await.map_err(|_| {
                StoreError::Unavailable("timed out opening hypervisor connection".to_string())
            })??);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Unavailable("no hypervisor connection".to_string()));
        };

        match timeout(self.call_timeout, exchange(conn, procedure, &payload)).await {
            Ok(Ok(body)) => Ok(body),
            // The daemon answered; the connection is still usable.
            Ok(Err(err @ StoreError::Hypervisor { .. })) => Err(err),
            Ok(Err(err)) => {
                *guard = None;
                Err(err)
            }
            Err(_) => {
                *guard = None;
                Err(StoreError::Unavailable(format!(
                    "hypervisor call {:?} timed out after {}ms",
                    procedure,
                    self.call_timeout.as_millis()
                )))
            }
        }
    }

    async fn domain_info(&self, domain: &DomainRef) -> Result<DomainInfo> {
        let mut args = XdrWriter::new();
        put_domain(&mut args, domain);
        let body = self.call(Procedure::DomainGetInfo, args).await?;
        let mut r = XdrReader::new(&body);
        Ok(DomainInfo {
            state: DomainStateCode(r.get_u32()? as u8),
            max_memory_kib: r.get_u64()?,
            memory_kib: r.get_u64()?,
            vcpus: r.get_u32()? as u16,
            cpu_time_ns: r.get_u64()?,
        })
    }

    async fn list_pools(&self) -> Result<Vec<(String, [u8; 16])>> {
        let mut args = XdrWriter::new();
        args.put_i32(1).put_u32(0);
        let body = self.call(Procedure::ConnectListAllStoragePools, args).await?;
        let mut r = XdrReader::new(&body);
        let count = r.get_array_len()?;
        let mut pools = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = r.get_string()?;
            let uuid = r.get_fixed_opaque::<16>()?;
            pools.push((name, uuid));
        }
        Ok(pools)
    }

    async fn list_pool_volumes(&self, pool: &(String, [u8; 16])) -> Result<Vec<StorageVolumeRecord>> {
        let mut args = XdrWriter::new();
        args.put_string(&pool.0)
            .put_fixed_opaque(&pool.1)
            .put_i32(1)
            .put_u32(0);
        let body = self.call(Procedure::StoragePoolListAllVolumes, args).await?;
        let mut r = XdrReader::new(&body);
        let count = r.get_array_len()?;
        let mut handles = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let pool = r.get_string()?;
            let name = r.get_string()?;
            let key = r.get_string()?;
            handles.push((pool, name, key));
        }

        let mut volumes = Vec::with_capacity(handles.len());
        for (pool, name, key) in handles {
            let vol_args = || {
                let mut w = XdrWriter::new();
                w.put_string(&pool).put_string(&name).put_string(&key);
                w
            };
            let body = self.call(Procedure::StorageVolGetPath, vol_args()).await?;
            let path = PathBuf::from(XdrReader::new(&body).get_string()?);

            let body = self.call(Procedure::StorageVolGetInfo, vol_args()).await?;
            let mut r = XdrReader::new(&body);
            let _kind = r.get_u32()?;
            let capacity = r.get_u64()?;
            let allocation = r.get_u64()?;

            volumes.push(StorageVolumeRecord {
                pool: pool.clone(),
                name: name.clone(),
                key: key.clone(),
                path,
                capacity,
                allocation,
            });
        }
        Ok(volumes)
    }
}

#[async_trait]
impl HypervisorClient for RemoteHypervisor {
    async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let mut args = XdrWriter::new();
        args.put_i32(1).put_u32(0);
        let body = self.call(Procedure::ConnectListAllDomains, args).await?;
        let mut r = XdrReader::new(&body);
        let count = r.get_array_len()?;
        let mut domains = Vec::with_capacity(count as usize);
        for _ in 0..count {
            domains.push(get_domain(&mut r)?);
        }

        let mut records = Vec::with_capacity(domains.len());
        for domain in domains {
            match self.domain_info(&domain).await {
                Ok(info) => records.push(DomainRecord { domain, info }),
                // Undefined between listing and the info call.
                Err(StoreError::Hypervisor { code: ERR_NO_DOMAIN, .. }) => {
                    debug!(domain = %domain.name, "domain vanished during enumeration");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainRecord>> {
        let mut args = XdrWriter::new();
        args.put_string(name);
        let domain = match self.call(Procedure::DomainLookupByName, args).await {
            Ok(body) => get_domain(&mut XdrReader::new(&body))?,
            Err(StoreError::Hypervisor { code: ERR_NO_DOMAIN, .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        match self.domain_info(&domain).await {
            Ok(info) => Ok(Some(DomainRecord { domain, info })),
            Err(StoreError::Hypervisor { code: ERR_NO_DOMAIN, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn domain_metadata(&self, domain: &DomainRef, uri: &str) -> Result<Option<String>> {
        let mut args = XdrWriter::new();
        put_domain(&mut args, domain);
        args.put_i32(METADATA_ELEMENT)
            .put_opt_string(Some(uri))
            .put_u32(0);
        match self.call(Procedure::DomainGetMetadata, args).await {
            Ok(body) => Ok(Some(XdrReader::new(&body).get_string()?)),
            Err(StoreError::Hypervisor {
                code: ERR_NO_DOMAIN_METADATA,
                ..
            }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set_domain_metadata(
        &self,
        domain: &DomainRef,
        metadata: Option<&str>,
        key: &str,
        uri: &str,
        flags: MetadataFlags,
    ) -> Result<()> {
        let mut args = XdrWriter::new();
        put_domain(&mut args, domain);
        args.put_i32(METADATA_ELEMENT)
            .put_opt_string(metadata)
            .put_opt_string(metadata.map(|_| key))
            .put_opt_string(Some(uri))
            .put_u32(flags.bits());
        self.call(Procedure::DomainSetMetadata, args).await?;
        Ok(())
    }

    async fn list_storage_volumes(&self) -> Result<Vec<StorageVolumeRecord>> {
        let mut volumes = Vec::new();
        for pool in self.list_pools().await? {
            match self.list_pool_volumes(&pool).await {
                Ok(mut found) => volumes.append(&mut found),
                Err(err @ StoreError::Hypervisor { .. }) => {
                    // Inactive pools refuse listing; the others are still useful.
                    warn!(pool = %pool.0, error = %err, "skipping storage pool");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(volumes)
    }
}

fn put_domain(w: &mut XdrWriter, domain: &DomainRef) {
    w.put_string(&domain.name)
        .put_fixed_opaque(&domain.uuid)
        .put_i32(domain.id);
}

fn get_domain(r: &mut XdrReader<'_>) -> Result<DomainRef> {
    Ok(DomainRef {
        name: r.get_string()?,
        uuid: r.get_fixed_opaque::<16>()?,
        id: r.get_i32()?,
    })
}

fn encode_call(procedure: Procedure, serial: u32, payload: &[u8]) -> Vec<u8> {
    let mut w = XdrWriter::new();
    w.put_u32((4 + HEADER_LEN + payload.len()) as u32)
        .put_u32(REMOTE_PROGRAM)
        .put_u32(REMOTE_PROTOCOL_VERSION)
        .put_i32(procedure as i32)
        .put_i32(TYPE_CALL)
        .put_u32(serial)
        .put_i32(STATUS_OK);
    let mut packet = w.into_bytes();
    packet.extend_from_slice(payload);
    packet
}

struct ReplyHeader {
    program: u32,
    procedure: i32,
    kind: i32,
    serial: u32,
    status: i32,
}

fn decode_header(r: &mut XdrReader<'_>) -> Result<ReplyHeader> {
    let program = r.get_u32()?;
    let _version = r.get_u32()?;
    Ok(ReplyHeader {
        program,
        procedure: r.get_i32()?,
        kind: r.get_i32()?,
        serial: r.get_u32()?,
        status: r.get_i32()?,
    })
}

/// Leading fields of the daemon's error struct; the rest is not needed.
fn decode_error(body: &[u8]) -> StoreError {
    fn fields(body: &[u8]) -> Result<(i32, Option<String>)> {
        let mut r = XdrReader::new(body);
        let code = r.get_i32()?;
        let _domain = r.get_i32()?;
        let message = r.get_opt_string()?;
        Ok((code, message))
    }
    match fields(body) {
        Ok((code, message)) => StoreError::Hypervisor {
            code,
            message: message.unwrap_or_else(|| "unknown error".to_string()),
        },
        Err(err) => err,
    }
}

async fn exchange(conn: &mut Connection, procedure: Procedure, payload: &[u8]) -> Result<Vec<u8>> {
    conn.serial = conn.serial.wrapping_add(1);
    let serial = conn.serial;
    let packet = encode_call(procedure, serial, payload);
    conn.stream
        .write_all(&packet)
        .await
        .map_err(|e| StoreError::Unavailable(format!("write {:?}: {}", procedure, e)))?;

    loop {
        let packet = read_packet(&mut conn.stream).await?;
        let mut r = XdrReader::new(&packet);
        let header = decode_header(&mut r)?;
        if header.program != REMOTE_PROGRAM {
            return Err(StoreError::Protocol(format!(
                "unexpected program {:#x}",
                header.program
            )));
        }
        // Asynchronous event messages share the socket; skip anything that is
        // not the reply to this call.
        if header.kind != TYPE_REPLY || header.serial != serial {
            debug!(procedure = header.procedure, kind = header.kind, "skipping unsolicited packet");
            continue;
        }
        let body = packet[HEADER_LEN..].to_vec();
        return match header.status {
            STATUS_OK => Ok(body),
            STATUS_ERROR => Err(decode_error(&body)),
            other => Err(StoreError::Protocol(format!("unexpected reply status {}", other))),
        };
    }
}

async fn read_packet(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| StoreError::Unavailable(format!("read packet length: {}", e)))?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if !(4 + HEADER_LEN..=MAX_PACKET).contains(&len) {
        return Err(StoreError::Protocol(format!("invalid packet length {}", len)));
    }
    let mut packet = vec![0u8; len - 4];
    stream
        .read_exact(&mut packet)
        .await
        .map_err(|e| StoreError::Unavailable(format!("read packet body: {}", e)))?;
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    fn reply(procedure: i32, serial: u32, status: i32, body: &[u8]) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.put_u32((4 + HEADER_LEN + body.len()) as u32)
            .put_u32(REMOTE_PROGRAM)
            .put_u32(REMOTE_PROTOCOL_VERSION)
            .put_i32(procedure)
            .put_i32(TYPE_REPLY)
            .put_u32(serial)
            .put_i32(status);
        let mut packet = w.into_bytes();
        packet.extend_from_slice(body);
        packet
    }

    async fn read_call(stream: &mut UnixStream) -> (i32, u32, Vec<u8>) {
        let packet = read_packet(stream).await.unwrap();
        let mut r = XdrReader::new(&packet);
        let header = decode_header(&mut r).unwrap();
        assert_eq!(header.kind, TYPE_CALL);
        (header.procedure, header.serial, packet[HEADER_LEN..].to_vec())
    }

    #[test]
    fn test_call_packet_layout() {
        let packet = encode_call(Procedure::DomainGetMetadata, 7, &[1, 2, 3, 4]);
        assert_eq!(packet.len(), 4 + HEADER_LEN + 4);
        assert_eq!(&packet[..4], &(32u32).to_be_bytes());
        assert_eq!(&packet[4..8], &REMOTE_PROGRAM.to_be_bytes());
        assert_eq!(&packet[12..16], &265i32.to_be_bytes());
        assert_eq!(&packet[20..24], &7u32.to_be_bytes());
    }

    #[test]
    fn test_decode_error_reply() {
        let mut w = XdrWriter::new();
        w.put_i32(ERR_NO_DOMAIN_METADATA)
            .put_i32(10)
            .put_opt_string(Some("metadata not found"));
        match decode_error(&w.into_bytes()) {
            StoreError::Hypervisor { code, message } => {
                assert_eq!(code, ERR_NO_DOMAIN_METADATA);
                assert_eq!(message, "metadata not found");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_metadata_roundtrip_against_fake_daemon() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let socket = temp_dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let (procedure, serial, _) = read_call(&mut stream).await;
            assert_eq!(procedure, Procedure::ConnectOpen as i32);
            stream.write_all(&reply(procedure, serial, STATUS_OK, &[])).await.unwrap();

            let (procedure, serial, _) = read_call(&mut stream).await;
            assert_eq!(procedure, Procedure::DomainGetMetadata as i32);
            let mut err = XdrWriter::new();
            err.put_i32(ERR_NO_DOMAIN_METADATA).put_i32(10).put_opt_string(None);
            stream
                .write_all(&reply(procedure, serial, STATUS_ERROR, &err.into_bytes()))
                .await
                .unwrap();

            let (procedure, serial, _) = read_call(&mut stream).await;
            assert_eq!(procedure, Procedure::DomainGetMetadata as i32);
            // An unrelated event before the real reply must be skipped.
            stream.write_all(&reply(999, 0, STATUS_OK, &[])).await.unwrap();
            let mut ok = XdrWriter::new();
            ok.put_string("<instance><id>i-1</id></instance>");
            stream
                .write_all(&reply(procedure, serial, STATUS_OK, &ok.into_bytes()))
                .await
                .unwrap();
        });

        let config = HypervisorConfig {
            socket_path: socket,
            ..HypervisorConfig::default()
        };
        let client = RemoteHypervisor::new(&config);
        let domain = DomainRef {
            name: "web".to_string(),
            uuid: [0u8; 16],
            id: 1,
        };
        assert_eq!(client.domain_metadata(&domain, "urn:x").await.unwrap(), None);
        assert_eq!(
            client.domain_metadata(&domain, "urn:x").await.unwrap().as_deref(),
            Some("<instance><id>i-1</id></instance>")
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = HypervisorConfig {
            socket_path: temp_dir.path().join("absent.sock"),
            ..HypervisorConfig::default()
        };
        let client = RemoteHypervisor::new(&config);
        let err = client.list_domains().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
