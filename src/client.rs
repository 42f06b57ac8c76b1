//! Client facade: named commands on top of an [`RpcClient`].

use futures::StreamExt;
use std::{path::PathBuf, time::Instant};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::bench::{Benchmark, Experiment, ExperimentError};
use crate::commands::{CliCommand, HELP};
use crate::error::{ErrorKind, TransferError, TransferOutcome};
use crate::messages::{
    self, method, AclRequest, ClientListResponse, DeleteRequest, FileListResponse, FilesRequest,
    ListRequest, RegisterRequest, RegisterResponse, StatusResponse, TransferRequest, LARGE_CHUNK,
};
use crate::session::{ClientDownloadReceiver, ClientUploadSender};
use crate::store::{FileRecord, FileWriter};
use crate::streaming::TimeoutStream;
use crate::{RpcClient, RpcError, INITIAL_REQUEST_N, TRANSFER_METHOD};

pub const LOGGED_IN: &str = "Logged in as user";
pub const CLIENTS: &str = "The following clients exist:";
pub const FILES: &str = "You have access to the following files:";
pub const GENERIC_ERROR: &str = "Something went wrong. Make sure the values you provided are correct.";
pub const INVALID_COMMAND: &str = "Please supply a valid command.";
pub const INPUT_PROMPT: &str = "Please enter a command: (type 'help' for commands)";
pub const RUNNING_TESTS: &str = "Running the tests...";
pub const EXPERIMENT_SAVED: &str = "Successfully saved the experiment data in a csv.";
pub const EXPERIMENT_ERROR: &str =
    "An error occurred while saving the experiment data. See the debug logs.";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    #[error("{}", messages::INVALID_USERNAME)]
    InvalidUsername,

    #[error("server rejected {0}")]
    Rejected(&'static str),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Source of uploads and destination of downloads.
    pub files_dir: PathBuf,
    pub experiments_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            files_dir: PathBuf::from("files"),
            experiments_dir: PathBuf::from("experiments"),
        }
    }
}

impl ClientConfig {
    pub fn new(files_dir: impl Into<PathBuf>, experiments_dir: impl Into<PathBuf>) -> Self {
        Self {
            files_dir: files_dir.into(),
            experiments_dir: experiments_dir.into(),
        }
    }
}

/// Result of an `automate` run.
#[derive(Debug)]
pub struct AutomateReport {
    pub experiment: Experiment,
    pub attempts: usize,
    pub csv_path: PathBuf,
}

/// A registered user's connection to the file sharing server.
pub struct FileShareClient {
    rpc: RpcClient,
    username: String,
    config: ClientConfig,
}

impl FileShareClient {
    /// Registers `username` (letters and digits only) and logs in as it.
    pub async fn register(
        rpc: RpcClient,
        username: &str,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let username = messages::sanitize_alphanumeric(username);
        if username.is_empty() {
            return Err(ClientError::InvalidUsername);
        }
        let response: RegisterResponse = rpc
            .call_typed(
                method::REGISTER,
                &RegisterRequest {
                    username: username.clone(),
                },
            )
            .await?;
        if !response.status.is_success() {
            return Err(ClientError::Rejected(method::REGISTER));
        }
        info!(%username, "registered");
        Ok(Self {
            rpc,
            username: response.username,
            config,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn client_list(&self) -> Result<Vec<String>, ClientError> {
        let response: ClientListResponse = self.rpc.call_typed(method::LIST, &ListRequest).await?;
        if !response.status.is_success() {
            return Err(ClientError::Rejected(method::LIST));
        }
        Ok(response.clients)
    }

    pub async fn files(&self) -> Result<Vec<FileRecord>, ClientError> {
        let response: FileListResponse = self
            .rpc
            .call_typed(
                method::FILES,
                &FilesRequest {
                    username: self.username.clone(),
                },
            )
            .await?;
        if !response.status.is_success() {
            return Err(ClientError::Rejected(method::FILES));
        }
        Ok(response.files)
    }

    pub async fn grant(&self, filename: &str, subject: &str) -> Result<bool, ClientError> {
        self.acl(method::GRANT, filename, subject).await
    }

    pub async fn revoke(&self, filename: &str, subject: &str) -> Result<bool, ClientError> {
        self.acl(method::REVOKE, filename, subject).await
    }

    async fn acl(&self, method: &str, filename: &str, subject: &str) -> Result<bool, ClientError> {
        let request = AclRequest {
            filename: filename.to_string(),
            owner: self.username.clone(),
            subject: subject.to_string(),
        };
        let response: StatusResponse = self.rpc.call_typed(method, &request).await?;
        Ok(response.status.is_success())
    }

    pub async fn delete(&self, filename: &str) -> Result<bool, ClientError> {
        let request = DeleteRequest {
            filename: filename.to_string(),
            owner: self.username.clone(),
        };
        let response: StatusResponse = self.rpc.call_typed(method::DELETE, &request).await?;
        Ok(response.status.is_success())
    }

    /// Uploads `files_dir/filename` as a file owned by this user.
    pub async fn upload(&self, filename: &str) -> Result<TransferOutcome, ClientError> {
        messages::validate_name("filename", filename)?;
        let mut source = fs::File::open(self.config.files_dir.join(filename)).await?;

        let request = TransferRequest::upload(&self.username, filename);
        let (mut sender, mut receiver) = self
            .rpc
            .open_channel(TRANSFER_METHOD, request.encode()?, INITIAL_REQUEST_N)
            .await?;

        let outcome = ClientUploadSender::new(&self.username, filename, LARGE_CHUNK)
            .with_timeout(self.rpc.config().default_stream_timeout)
            .run(&mut source, &mut sender, &mut receiver)
            .await;
        Ok(outcome)
    }

    /// Downloads `owner`'s `filename` to `files_dir/{owner}_{filename}`.
    /// `automated` runs skip the local write and are only timed.
    pub async fn download(
        &self,
        filename: &str,
        owner: &str,
        chunk_size: u32,
        automated: bool,
    ) -> Result<(TransferOutcome, Option<Benchmark>), ClientError> {
        let request = TransferRequest::download(&self.username, owner, filename, chunk_size);
        request.validate()?;

        let receiver_session = if automated {
            ClientDownloadReceiver::new(owner, filename, None)
        } else {
            match self.open_destination(owner, filename).await {
                Ok(writer) => ClientDownloadReceiver::new(owner, filename, Some(writer)),
                Err(err) => ClientDownloadReceiver::unwritable(owner, filename, err),
            }
        };

        let (mut sender, receiver) = self
            .rpc
            .open_channel(TRANSFER_METHOD, request.encode()?, INITIAL_REQUEST_N)
            .await?;
        let mut inbound = Box::pin(
            TimeoutStream::new(receiver, self.rpc.config().default_stream_timeout)
                .map(|item| item.map_err(TransferError::from)),
        );

        let started = Instant::now();
        let outcome = receiver_session.run(&mut sender, &mut inbound).await;
        let elapsed = started.elapsed();

        let bench = (outcome.success && outcome.chunk_count != 0)
            .then(|| Benchmark::new(chunk_size, outcome.chunk_count, elapsed));
        Ok((outcome, bench))
    }

    async fn open_destination(&self, owner: &str, filename: &str) -> std::io::Result<FileWriter> {
        fs::create_dir_all(&self.config.files_dir).await?;
        let path = self
            .config
            .files_dir
            .join(messages::backing_file_name(owner, filename));
        let file = fs::File::create(path).await?;
        Ok(Box::new(file) as FileWriter)
    }

    /// Repeats automated downloads until `num_tests` succeed and saves their
    /// timings. Gives up after twice as many attempts, or at once when the
    /// server denies access.
    pub async fn automate(
        &self,
        experiment: &str,
        num_tests: usize,
        filename: &str,
        owner: &str,
        chunk_size: u32,
    ) -> Result<AutomateReport, ClientError> {
        let mut results = Experiment::new(experiment)?;
        let max_attempts = num_tests.saturating_mul(2).max(1);
        let mut attempts = 0;

        while results.entries().len() < num_tests && attempts < max_attempts {
            attempts += 1;
            let (outcome, bench) = self.download(filename, owner, chunk_size, true).await?;
            match bench {
                Some(bench) => {
                    results.add_entry(bench);
                    debug!("Test {} was completed successfully.", results.entries().len());
                }
                None => {
                    warn!("Test {attempts} failed.");
                    if outcome.error_kind == Some(ErrorKind::AccessDenied) {
                        break;
                    }
                }
            }
        }

        let csv_path = results.save_to_csv(&self.config.experiments_dir)?;
        Ok(AutomateReport {
            experiment: results,
            attempts,
            csv_path,
        })
    }

    /// Runs one parsed command, printing what the user should see. Returns
    /// `false` once the user asked to quit.
    pub async fn execute(&self, command: CliCommand) -> bool {
        debug!(?command, "executing");
        match command {
            CliCommand::Quit => return false,
            CliCommand::Help => println!("{HELP}"),
            CliCommand::List => match self.client_list().await {
                Ok(clients) => {
                    println!("{CLIENTS}");
                    for client in clients {
                        println!("{client}");
                    }
                }
                Err(err) => report(&err, messages::DATA_ERROR),
            },
            CliCommand::Files => match self.files().await {
                Ok(files) => {
                    println!("{FILES}");
                    for file in files {
                        println!("Filename: {}, Owner: {}", file.filename, file.owner);
                    }
                }
                Err(err) => report(&err, messages::DATA_ERROR),
            },
            CliCommand::Grant { filename, subject } => match self.grant(&filename, &subject).await {
                Ok(true) => println!("Access granted to user {subject}."),
                Ok(false) => println!("{}", messages::GRANT_ERROR),
                Err(err) => report(&err, messages::DATA_ERROR),
            },
            CliCommand::Revoke { filename, subject } => match self.revoke(&filename, &subject).await {
                Ok(true) => println!("Access revoked for user {subject}."),
                Ok(false) => println!("{}", messages::REVOKE_ERROR),
                Err(err) => report(&err, messages::DATA_ERROR),
            },
            CliCommand::Delete { filename } => match self.delete(&filename).await {
                Ok(true) => println!("{}", messages::FILE_DELETED),
                Ok(false) => println!("{}", messages::DELETE_ERROR),
                Err(err) => report(&err, messages::DELETE_ERROR),
            },
            CliCommand::Upload { filename } => {
                let failed = messages::upload_failed(&filename, &self.username);
                match self.upload(&filename).await {
                    Ok(outcome) if outcome.success => println!("{}", messages::FILE_UPLOADED),
                    Ok(_) => println!("{failed}"),
                    Err(err) => report(&err, &failed),
                }
            }
            CliCommand::Download {
                filename,
                owner,
                chunk_size,
            } => match self.download(&filename, &owner, chunk_size, false).await {
                Ok((outcome, bench)) if outcome.success => {
                    println!("{}", messages::file_downloaded(&filename));
                    if let Some(bench) = bench {
                        println!("{bench}");
                    }
                }
                Ok((outcome, _)) if outcome.error_kind == Some(ErrorKind::AccessDenied) => {
                    println!("{}", messages::ACCESS_DENIED)
                }
                Ok(_) => println!("{}", messages::download_failed(&filename, &owner)),
                Err(err) => report(&err, &messages::download_failed(&filename, &owner)),
            },
            CliCommand::Automate {
                experiment,
                num_tests,
                filename,
                owner,
                chunk_size,
            } => {
                println!("{RUNNING_TESTS}");
                match self
                    .automate(&experiment, num_tests, &filename, &owner, chunk_size)
                    .await
                {
                    Ok(summary) => {
                        for bench in summary.experiment.entries() {
                            println!("{bench}");
                        }
                        println!("{EXPERIMENT_SAVED}");
                    }
                    Err(err) => report(&err, EXPERIMENT_ERROR),
                }
            }
        }
        true
    }
}

fn report(err: &ClientError, message: &str) {
    debug!("command failed: {err}");
    match err {
        ClientError::Rejected(_) => println!("{GENERIC_ERROR}"),
        _ => println!("{message}"),
    }
}
