//! The file sharing service mounted on an [`RpcServer`].

use std::{path::PathBuf, sync::Arc};
use tracing::{debug, warn};

use crate::controller::TransferController;
use crate::messages::{
    self, method, AclRequest, ClientListResponse, DeleteRequest, FileListResponse, FilesRequest,
    ListRequest, RegisterRequest, RegisterResponse, Status, StatusResponse,
};
use crate::store::{Catalog, FileService, MemoryCatalog, SqliteCatalog, StoreError};
use crate::RpcServer;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding the uploaded files.
    pub files_dir: PathBuf,
    /// SQLite catalog path. `None` keeps the catalog in memory.
    pub database: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            files_dir: PathBuf::from("files"),
            database: Some(PathBuf::from("project.db")),
        }
    }
}

impl ServerConfig {
    pub fn new(files_dir: impl Into<PathBuf>) -> Self {
        Self {
            files_dir: files_dir.into(),
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<PathBuf>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.database = None;
        self
    }
}

pub struct FileShareServer<C> {
    service: Arc<FileService<C>>,
    controller: TransferController,
}

impl FileShareServer<SqliteCatalog> {
    pub fn open_sqlite(files_dir: impl Into<PathBuf>, database: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let catalog = SqliteCatalog::open(database.into())?;
        Ok(Self::new(FileService::new(catalog, files_dir)))
    }
}

impl FileShareServer<MemoryCatalog> {
    pub fn in_memory(files_dir: impl Into<PathBuf>) -> Self {
        Self::new(FileService::new(MemoryCatalog::new(), files_dir))
    }
}

impl<C: Catalog + 'static> FileShareServer<C> {
    pub fn new(service: FileService<C>) -> Self {
        let service = Arc::new(service);
        let controller = TransferController::new(service.clone(), service.clone());
        Self {
            service,
            controller,
        }
    }

    pub fn service(&self) -> &Arc<FileService<C>> {
        &self.service
    }

    pub fn controller(&self) -> &TransferController {
        &self.controller
    }

    /// Registers every request/response command and the transfer channel.
    pub async fn install(&self, server: &RpcServer) {
        let service = self.service.clone();
        server
            .register_typed(method::REGISTER, move |request: RegisterRequest| {
                let service = service.clone();
                async move { Ok(register(&service, request)) }
            })
            .await;

        let service = self.service.clone();
        server
            .register_typed(method::LIST, move |_: ListRequest| {
                let service = service.clone();
                async move { Ok(client_list(&service)) }
            })
            .await;

        let service = self.service.clone();
        server
            .register_typed(method::FILES, move |request: FilesRequest| {
                let service = service.clone();
                async move { Ok(files(&service, request)) }
            })
            .await;

        let service = self.service.clone();
        server
            .register_typed(method::GRANT, move |request: AclRequest| {
                let service = service.clone();
                async move { Ok(grant(&service, request)) }
            })
            .await;

        let service = self.service.clone();
        server
            .register_typed(method::REVOKE, move |request: AclRequest| {
                let service = service.clone();
                async move { Ok(revoke(&service, request)) }
            })
            .await;

        let service = self.service.clone();
        server
            .register_typed(method::DELETE, move |request: DeleteRequest| {
                let service = service.clone();
                async move { Ok(delete(&service, request).await) }
            })
            .await;

        self.controller.register_on(server).await;
    }
}

fn register<C: Catalog>(service: &FileService<C>, request: RegisterRequest) -> RegisterResponse {
    match service.register(&request.username) {
        Ok(username) => {
            debug!(%username, "user registered");
            RegisterResponse {
                status: Status::Success,
                username,
            }
        }
        Err(err) => {
            warn!(username = %request.username, "registration failed: {err}");
            RegisterResponse {
                status: Status::Error,
                username: String::new(),
            }
        }
    }
}

fn client_list<C: Catalog>(service: &FileService<C>) -> ClientListResponse {
    match service.client_list() {
        Ok(clients) => ClientListResponse {
            status: Status::Success,
            clients,
        },
        Err(err) => {
            warn!("listing clients failed: {err}");
            ClientListResponse {
                status: Status::Error,
                clients: Vec::new(),
            }
        }
    }
}

fn files<C: Catalog>(service: &FileService<C>, request: FilesRequest) -> FileListResponse {
    match service.list_files(&request.username) {
        Ok(files) => FileListResponse {
            status: Status::Success,
            files,
        },
        Err(err) => {
            warn!(username = %request.username, "listing files failed: {err}");
            FileListResponse {
                status: Status::Error,
                files: Vec::new(),
            }
        }
    }
}

fn grant<C: Catalog>(service: &FileService<C>, request: AclRequest) -> StatusResponse {
    let granted = service.create_acl_entry(&request.filename, &request.owner, &request.subject);
    let status = match granted {
        Ok(granted) => Status::from_success(granted),
        Err(err) => {
            warn!(filename = %request.filename, "grant failed: {err}");
            Status::Error
        }
    };
    StatusResponse { status }
}

fn revoke<C: Catalog>(service: &FileService<C>, request: AclRequest) -> StatusResponse {
    if let Err(err) = service.delete_acl_entry(&request.filename, &request.owner, &request.subject) {
        warn!(filename = %request.filename, "revoke failed: {err}");
    }
    StatusResponse {
        status: Status::Success,
    }
}

async fn delete<C: Catalog>(service: &FileService<C>, request: DeleteRequest) -> StatusResponse {
    if let Err(err) = messages::validate_name("filename", &request.filename)
        .and_then(|_| messages::validate_name("owner", &request.owner))
    {
        warn!("refusing delete: {err}");
        return StatusResponse {
            status: Status::Error,
        };
    }
    let status = match service.delete_file(&request.owner, &request.filename).await {
        Ok(()) => Status::Success,
        Err(err) => {
            warn!(owner = %request.owner, filename = %request.filename, "delete failed: {err}");
            Status::Error
        }
    };
    StatusResponse { status }
}
