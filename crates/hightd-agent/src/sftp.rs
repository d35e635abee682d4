use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use russh::server::{Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, MethodSet};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::instance::ServerInstance;
use crate::registry::ServerRegistry;
use crate::remote::RemoteClient;
use crate::sandbox;

pub const HOST_KEY_FILE: &str = "sftp_host_key.pem";

/// The SFTP username carries both identities: `{user}_{serverId}`, split on
/// the last underscore (the user part may itself contain underscores).
pub fn split_username(raw: &str) -> Option<(&str, &str)> {
    let (user, server) = raw.rsplit_once('_')?;
    if user.is_empty() || server.is_empty() {
        return None;
    }
    Some((user, server))
}

/// Load the persistent host key, generating it (RSA-2048, PKCS#1 PEM) when
/// missing or unreadable.
pub fn load_or_create_host_key(base: &Path) -> anyhow::Result<russh_keys::key::KeyPair> {
    let path = base.join(HOST_KEY_FILE);

    if let Ok(pem) = std::fs::read_to_string(&path)
        && let Ok(key) = russh_keys::decode_secret_key(&pem, None)
    {
        return Ok(key);
    }

    tracing::info!(path = %path.display(), "generating sftp host key");
    let private = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
        .context("generate sftp host key")?;
    let pem = rsa::pkcs1::EncodeRsaPrivateKey::to_pkcs1_pem(&private, rsa::pkcs1::LineEnding::LF)
        .context("encode sftp host key")?;

    std::fs::create_dir_all(base)
        .with_context(|| format!("create base directory {}", base.display()))?;
    let tmp = path.with_extension("pem.tmp");
    std::fs::write(&tmp, pem.as_bytes())
        .with_context(|| format!("write host key {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("persist host key {}", path.display()))?;

    russh_keys::decode_secret_key(&pem, None).context("parse generated host key")
}

/// Bind the SFTP listener and serve forever on a background task.
pub async fn spawn(
    port: u16,
    base: PathBuf,
    registry: Arc<ServerRegistry>,
    remote: RemoteClient,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let key = load_or_create_host_key(&base)?;

    let config = Arc::new(russh::server::Config {
        methods: MethodSet::PASSWORD,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![key],
        ..Default::default()
    });

    let socket = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind sftp port {port}"))?;
    tracing::info!(port, "sftp listening");

    let mut server = SftpServer { registry, remote };
    Ok(tokio::spawn(async move {
        if let Err(err) = server.run_on_socket(config, &socket).await {
            tracing::error!(%err, "sftp server terminated");
        }
    }))
}

#[derive(Clone)]
struct SftpServer {
    registry: Arc<ServerRegistry>,
    remote: RemoteClient,
}

impl russh::server::Server for SftpServer {
    type Handler = SshSession;

    fn new_client(&mut self, _peer: Option<SocketAddr>) -> SshSession {
        SshSession {
            registry: self.registry.clone(),
            remote: self.remote.clone(),
            instance: None,
            channels: HashMap::new(),
        }
    }
}

struct SshSession {
    registry: Arc<ServerRegistry>,
    remote: RemoteClient,
    instance: Option<Arc<ServerInstance>>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

#[async_trait]
impl russh::server::Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PASSWORD),
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let reject = Auth::Reject {
            proceed_with_methods: None,
        };

        let Some((user_name, server_ref)) = split_username(user) else {
            return Ok(reject);
        };
        // Exact id first, then a unique prefix; ambiguity is a rejection.
        let Some(instance) = self.registry.find(server_ref).await else {
            return Ok(reject);
        };

        if self
            .remote
            .verify_sftp(user_name, password, instance.id())
            .await
        {
            self.instance = Some(instance);
            Ok(Auth::Accept)
        } else {
            Ok(reject)
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name == "sftp"
            && let Some(channel) = self.channels.remove(&channel_id)
            && let Some(instance) = self.instance.clone()
        {
            session.channel_success(channel_id);
            let handler = SftpHandler::new(instance.dir().clone());
            tokio::spawn(async move {
                russh_sftp::server::run(channel.into_stream(), handler).await;
            });
        } else {
            session.channel_failure(channel_id);
        }
        Ok(())
    }
}

struct OpenDir {
    files: Vec<File>,
    /// One-shot sentinel: the first READDIR returns everything, the second
    /// answers EOF.
    consumed: bool,
}

/// One handler per authenticated client. The handle tables live here, so a
/// disconnect releases everything the client left open.
struct SftpHandler {
    root: PathBuf,
    files: HashMap<String, tokio::fs::File>,
    dirs: HashMap<String, OpenDir>,
    next_handle: u64,
}

impl SftpHandler {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_handle: 0,
        }
    }

    fn resolve(&self, user_path: &str) -> Result<PathBuf, StatusCode> {
        sandbox::resolve_in(&self.root, user_path).map_err(|_| StatusCode::Failure)
    }

    fn virtualize(&self, abs: &Path) -> String {
        sandbox::virtualize_in(&self.root, abs)
    }

    fn allocate_handle(&mut self) -> String {
        self.next_handle += 1;
        format!("h{}", self.next_handle)
    }

    async fn attrs_of(&self, path: &Path, follow: bool) -> Result<FileAttributes, StatusCode> {
        let meta = if follow {
            tokio::fs::metadata(path).await
        } else {
            tokio::fs::symlink_metadata(path).await
        }
        .map_err(io_status)?;
        Ok(attrs_from(&meta))
    }
}

fn io_status(err: std::io::Error) -> StatusCode {
    match err.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

/// Attributes carry synthetic owner/group names so clients render the
/// usual `drwxr-xr-x 1 owner group size Mon DD YYYY name` long listing.
fn attrs_from(meta: &std::fs::Metadata) -> FileAttributes {
    let mut attrs = FileAttributes::from(meta);
    attrs.user = Some("owner".to_string());
    attrs.group = Some("group".to_string());
    attrs
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        _version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let abs = self.resolve(&path)?;
        Ok(Name {
            id,
            files: vec![File::dummy(self.virtualize(&abs))],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let abs = self.resolve(&path)?;
        let attrs = self.attrs_of(&abs, true).await?;
        Ok(Attrs { id, attrs })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let abs = self.resolve(&path)?;
        let attrs = self.attrs_of(&abs, false).await?;
        Ok(Attrs { id, attrs })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let file = self.files.get(&handle).ok_or(StatusCode::Failure)?;
        let meta = file.metadata().await.map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: attrs_from(&meta),
        })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let abs = self.resolve(&path)?;
        let mut rd = tokio::fs::read_dir(&abs).await.map_err(io_status)?;

        let mut files = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(io_status)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            files.push(File::new(name, attrs_from(&meta)));
        }
        files.sort_by(|a, b| a.filename.cmp(&b.filename));

        let handle = self.allocate_handle();
        self.dirs.insert(
            handle.clone(),
            OpenDir {
                files,
                consumed: false,
            },
        );
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let dir = self.dirs.get_mut(&handle).ok_or(StatusCode::Failure)?;
        if dir.consumed {
            return Err(StatusCode::Eof);
        }
        dir.consumed = true;
        Ok(Name {
            id,
            files: std::mem::take(&mut dir.files),
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let abs = self.resolve(&filename)?;
        let writing =
            pflags.contains(OpenFlags::WRITE) || pflags.contains(OpenFlags::CREATE);

        let file = if writing {
            if let Some(parent) = abs.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_status)?;
            }
            tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&abs)
                .await
                .map_err(io_status)?
        } else {
            tokio::fs::OpenOptions::new()
                .read(true)
                .open(&abs)
                .await
                .map_err(io_status)?
        };

        let handle = self.allocate_handle();
        self.files.insert(handle.clone(), file);
        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::Failure)?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(io_status)?;

        let mut data = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file.read(&mut data[filled..]).await.map_err(io_status)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(filled);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::Failure)?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(io_status)?;
        file.write_all(&data).await.map_err(io_status)?;
        Ok(ok_status(id))
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        if let Some(mut file) = self.files.remove(&handle) {
            let _ = file.flush().await;
            return Ok(ok_status(id));
        }
        if self.dirs.remove(&handle).is_some() {
            return Ok(ok_status(id));
        }
        Err(StatusCode::Failure)
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let abs = self.resolve(&filename)?;
        tokio::fs::remove_file(&abs).await.map_err(io_status)?;
        Ok(ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let abs = self.resolve(&path)?;
        tokio::fs::create_dir(&abs).await.map_err(io_status)?;
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let abs = self.resolve(&path)?;
        tokio::fs::remove_dir(&abs).await.map_err(io_status)?;
        Ok(ok_status(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let from = self.resolve(&oldpath)?;
        let to = self.resolve(&newpath)?;
        tokio::fs::rename(&from, &to).await.map_err(io_status)?;
        Ok(ok_status(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_sftp::server::Handler as _;

    #[test]
    fn username_splits_on_the_last_underscore() {
        assert_eq!(split_username("alice_s1"), Some(("alice", "s1")));
        assert_eq!(split_username("a_b_c_d"), Some(("a_b_c", "d")));
        assert_eq!(split_username("nounderscore"), None);
        assert_eq!(split_username("_s1"), None);
        assert_eq!(split_username("alice_"), None);
    }

    #[tokio::test]
    async fn handler_confines_paths_to_its_root() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = SftpHandler::new(tmp.path().to_path_buf());

        assert_eq!(
            handler.resolve("/data/save.dat").unwrap(),
            tmp.path().join("data").join("save.dat")
        );
        assert_eq!(
            handler.resolve("../../etc/passwd"),
            Err(StatusCode::Failure)
        );
    }

    #[tokio::test]
    async fn readdir_is_one_shot() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("hello.txt"), "hi")
            .await
            .unwrap();

        let mut handler = SftpHandler::new(tmp.path().to_path_buf());
        let handle = handler.opendir(1, "/".to_string()).await.unwrap().handle;

        let listing = handler.readdir(2, handle.clone()).await.unwrap();
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.files[0].filename, "hello.txt");

        assert_eq!(handler.readdir(3, handle.clone()).await.err(), Some(StatusCode::Eof));

        // CLOSE releases directory handles too.
        assert!(handler.close(4, handle.clone()).await.is_ok());
        assert_eq!(handler.readdir(5, handle).await.err(), Some(StatusCode::Failure));
    }

    #[tokio::test]
    async fn open_write_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut handler = SftpHandler::new(tmp.path().to_path_buf());

        let handle = handler
            .open(
                1,
                "/nested/hello.txt".to_string(),
                OpenFlags::WRITE | OpenFlags::CREATE,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;
        handler
            .write(2, handle.clone(), 0, b"hi".to_vec())
            .await
            .unwrap();
        handler.close(3, handle).await.unwrap();

        let handle = handler
            .open(
                4,
                "/nested/hello.txt".to_string(),
                OpenFlags::READ,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;
        let data = handler.read(5, handle.clone(), 0, 64).await.unwrap();
        assert_eq!(data.data, b"hi");

        // Reading past the end answers EOF.
        assert_eq!(
            handler.read(6, handle.clone(), 2, 64).await.err(),
            Some(StatusCode::Eof)
        );
        handler.close(7, handle).await.unwrap();

        let attrs = handler
            .stat(8, "/nested/hello.txt".to_string())
            .await
            .unwrap();
        assert_eq!(attrs.attrs.size, Some(2));
    }
}
