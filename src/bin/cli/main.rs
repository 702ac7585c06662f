use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use refsync::api::HttpApiClient;
use refsync::config::{CredentialStore, SyncConfig};
use refsync::store::SettingsStore;
use refsync::webdav::{VerificationError, WebDavClient, WebDavError};

#[derive(Parser)]
#[command(name = "refsync-cli", about = "Reference-library sync utility", version)]
struct Cli {
    /// Config file (default: <config dir>/refsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebDAV verification handshake
    VerifyWebdav,

    /// Create the sync directory on the WebDAV server
    CreateWebdavDir,

    /// Store the WebDAV password in the credential store
    SetWebdavPassword {
        /// Read the password from stdin instead of the argument
        #[arg(long)]
        stdin: bool,
        password: Option<String>,
    },

    /// Store the service API key in the credential store
    SetApiKey { key: String },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("refsync")
            .join("config.toml")
    })
}

fn webdav_client(config: &SyncConfig, credentials: &CredentialStore) -> Result<WebDavClient> {
    let session = config
        .webdav_session(credentials)
        .context("no [webdav] section in config")?;
    let api = Arc::new(HttpApiClient::new()?);
    let settings = Arc::new(SettingsStore::load(
        &config.data_dir().join("settings.json"),
    )?);
    let store = Arc::new(NullStore::new());
    Ok(WebDavClient::new(api, store, settings, session))
}

/// The CLI only drives the WebDAV handshake, which never touches the object
/// store.
struct NullStore {
    changes: tokio::sync::broadcast::Sender<refsync::store::StoreChange>,
}

impl NullStore {
    fn new() -> Self {
        let (changes, _) = tokio::sync::broadcast::channel(1);
        Self { changes }
    }
}

impl refsync::store::ObjectStore for NullStore {
    fn perform_all(
        &self,
        _requests: Vec<refsync::store::WriteRequest>,
    ) -> Result<(), refsync::store::StoreError> {
        Ok(())
    }

    fn libraries(
        &self,
        _selection: &refsync::LibrarySelection,
    ) -> Result<Vec<refsync::store::LibraryInfo>, refsync::store::StoreError> {
        Ok(Vec::new())
    }

    fn updates(
        &self,
        _library: refsync::LibraryIdentifier,
    ) -> Result<Vec<refsync::store::DirtyObject>, refsync::store::StoreError> {
        Ok(Vec::new())
    }

    fn deletions(
        &self,
        _library: refsync::LibraryIdentifier,
    ) -> Result<Vec<(refsync::SyncObject, String)>, refsync::store::StoreError> {
        Ok(Vec::new())
    }

    fn versions(
        &self,
        _library: refsync::LibraryIdentifier,
    ) -> Result<refsync::Versions, refsync::store::StoreError> {
        Ok(refsync::Versions::default())
    }

    fn pending_uploads(
        &self,
        _library: refsync::LibraryIdentifier,
    ) -> Result<Vec<refsync::AttachmentUpload>, refsync::store::StoreError> {
        Ok(Vec::new())
    }

    fn pending_file_deletions(
        &self,
        _library: refsync::LibraryIdentifier,
    ) -> Result<Vec<String>, refsync::store::StoreError> {
        Ok(Vec::new())
    }

    fn attachments_needing_download(
        &self,
        _library: refsync::LibraryIdentifier,
    ) -> Result<Vec<refsync::Attachment>, refsync::store::StoreError> {
        Ok(Vec::new())
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<refsync::store::StoreChange> {
        self.changes.subscribe()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let path = config_path(&cli);
    let config = SyncConfig::load(&path)
        .with_context(|| format!("could not load config from {}", path.display()))?;
    let credentials = CredentialStore::new(&config.data_dir());

    match cli.command {
        Command::VerifyWebdav => {
            let client = webdav_client(&config, &credentials)?;
            match client.verify().await {
                Ok(url) => println!("webdav verified: {}", url),
                Err(WebDavError::Verification(VerificationError::SyncDirNotFound(url))) => {
                    bail!(
                        "sync directory missing at {} (run create-webdav-dir to create it)",
                        url
                    );
                }
                Err(error) => bail!("verification failed: {}", error),
            }
        }
        Command::CreateWebdavDir => {
            let client = webdav_client(&config, &credentials)?;
            client
                .create_sync_directory()
                .await
                .context("could not create sync directory")?;
            println!("sync directory created");
        }
        Command::SetWebdavPassword { stdin, password } => {
            let webdav = config
                .webdav
                .as_ref()
                .context("no [webdav] section in config")?;
            let password = if stdin {
                let mut value = String::new();
                std::io::stdin().read_line(&mut value)?;
                value.trim().to_string()
            } else {
                password.context("pass the password or use --stdin")?
            };
            credentials.set(&format!("webdav-{}", webdav.username), &password)?;
            println!("webdav password stored");
        }
        Command::SetApiKey { key } => {
            credentials.set(&format!("api-key-{}", config.user_id), &key)?;
            println!("api key stored");
        }
    }

    Ok(())
}
