//! Wire messages and the user-facing text that goes with them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{ErrorKind, TransferError};
use crate::frame::MAX_FRAME_LEN;
use crate::store::FileRecord;

/// Hard bound on chunks a downloading client accepts in one transfer.
pub const CHUNK_CAP: u64 = 4000;
pub const LARGE_CHUNK: u32 = 2048;
pub const SMALL_CHUNK: u32 = 256;
/// Each chunk travels in one frame, so it can be no larger than a frame.
pub const MAX_CHUNK_SIZE: u32 = MAX_FRAME_LEN as u32;

pub const ACCESS_DENIED: &str = "Access Denied.";
pub const FILE_SENT: &str = "File was sent successfully.";
pub const FILE_UPLOADED: &str = "File uploaded successfully.";
pub const FILE_DELETED: &str = "Deleted the file successfully.";
pub const DELETE_ERROR: &str =
    "Error trying to delete the specified file. Ensure the given values are correct.";
pub const GRANT_ERROR: &str =
    "Unable to grant access to that user. Ensure all provided values are correct.";
pub const REVOKE_ERROR: &str =
    "Unable to revoke access for that user. Ensure all provided values are correct.";
pub const DATA_ERROR: &str = "There was an issue while getting data from the server.";
pub const INVALID_USERNAME: &str =
    "That username contains an invalid syntax. Please use letters and numbers only.";

pub fn upload_failed(filename: &str, owner: &str) -> String {
    format!("Upload failed for file {filename} and user {owner}.")
}

pub fn download_failed(filename: &str, owner: &str) -> String {
    format!("Download failed for file {filename} and user {owner}.")
}

pub fn file_created(filename: &str) -> String {
    format!("File {filename} created successfully.")
}

pub fn file_downloaded(filename: &str) -> String {
    format!("File {filename} downloaded successfully.")
}

/// Name of the on-disk file backing `owner`'s `filename`.
pub fn backing_file_name(owner: &str, filename: &str) -> String {
    format!("{owner}_{filename}")
}

/// Keeps only ASCII letters and digits.
pub fn sanitize_alphanumeric(text: &str) -> String {
    text.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// Rejects names that are empty or could escape the files directory.
pub fn validate_name(field: &str, value: &str) -> Result<(), TransferError> {
    if value.is_empty() {
        return Err(TransferError::Protocol(format!("{field} must not be empty")));
    }
    if value.contains(['/', '\\', '\0']) || value == "." || value.contains("..") {
        return Err(TransferError::Protocol(format!(
            "{field} {value:?} is not a plain file name"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Upload,
    Download,
}

/// A validated request to open a transfer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub command: Command,
    pub filename: String,
    pub owner: String,
    /// Identity the transfer runs as. Equal to `owner` for uploads.
    pub subject: String,
    /// Bytes per chunk; present for downloads only.
    pub chunk_size: Option<u32>,
}

impl TransferRequest {
    pub fn upload(owner: impl Into<String>, filename: impl Into<String>) -> Self {
        let owner = owner.into();
        Self {
            command: Command::Upload,
            filename: filename.into(),
            subject: owner.clone(),
            owner,
            chunk_size: None,
        }
    }

    pub fn download(
        subject: impl Into<String>,
        owner: impl Into<String>,
        filename: impl Into<String>,
        chunk_size: u32,
    ) -> Self {
        Self {
            command: Command::Download,
            filename: filename.into(),
            owner: owner.into(),
            subject: subject.into(),
            chunk_size: Some(chunk_size),
        }
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        validate_name("filename", &self.filename)?;
        validate_name("owner", &self.owner)?;
        validate_name("subject", &self.subject)?;
        match (self.command, self.chunk_size) {
            (_, Some(0)) => Err(TransferError::Protocol(
                "chunk size must be positive".to_string(),
            )),
            (_, Some(size)) if size > MAX_CHUNK_SIZE => Err(TransferError::Protocol(format!(
                "chunk size {size} exceeds the {MAX_CHUNK_SIZE} byte limit"
            ))),
            (Command::Download, None) => Err(TransferError::Protocol(
                "download requests need a chunk size".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Result<Bytes, TransferError> {
        let wire = match self.command {
            Command::Upload => WireTransferRequest::Upload(UploadBody {
                filename: self.filename.clone(),
                owner: self.owner.clone(),
            }),
            Command::Download => WireTransferRequest::Download(DownloadBody {
                filename: self.filename.clone(),
                owner: self.owner.clone(),
                subject: self.subject.clone(),
                size: self.chunk_size.unwrap_or(LARGE_CHUNK),
            }),
        };
        codec::encode_control(&wire)
    }

    /// Decodes and validates channel metadata.
    pub fn decode(payload: &[u8]) -> Result<Self, TransferError> {
        let request = match codec::decode_control::<WireTransferRequest>(payload)? {
            WireTransferRequest::Upload(body) => Self::upload(body.owner, body.filename),
            WireTransferRequest::Download(body) => {
                Self::download(body.subject, body.owner, body.filename, body.size)
            }
        };
        request.validate()?;
        Ok(request)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "lowercase")]
enum WireTransferRequest {
    Upload(UploadBody),
    Download(DownloadBody),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct UploadBody {
    filename: String,
    owner: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DownloadBody {
    filename: String,
    owner: String,
    subject: String,
    size: u32,
}

/// Control dictionaries exchanged inside a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "UPPERCASE")]
pub enum Control {
    /// Sent by a downloading client to start the drain.
    Begin,
}

/// Body of an `ERROR` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

/// Request/response method names.
pub mod method {
    pub const REGISTER: &str = "register";
    pub const LIST: &str = "list";
    pub const FILES: &str = "files";
    pub const GRANT: &str = "grant";
    pub const REVOKE: &str = "revoke";
    pub const DELETE: &str = "delete";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Error,
}

impl Status {
    pub fn from_success(success: bool) -> Self {
        if success {
            Status::Success
        } else {
            Status::Error
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesRequest {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRequest {
    pub filename: String,
    pub owner: String,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub filename: String,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: Status,
    /// The name as stored, after sanitising.
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientListResponse {
    pub status: Status,
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListResponse {
    pub status: Status,
    pub files: Vec<FileRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Extra<'a> {
        message: &'a str,
        filename: &'a str,
        owner: &'a str,
        mode: &'a str,
    }

    #[test]
    fn download_request_decodes_with_size() {
        let encoded = TransferRequest::download("bob", "alice", "notes", 256)
            .encode()
            .unwrap();
        let request = TransferRequest::decode(&encoded).unwrap();
        assert_eq!(request.command, Command::Download);
        assert_eq!(request.subject, "bob");
        assert_eq!(request.owner, "alice");
        assert_eq!(request.chunk_size, Some(256));
    }

    #[test]
    fn upload_request_runs_as_owner() {
        let mut wire = BTreeMap::new();
        wire.insert("message", "upload");
        wire.insert("filename", "notes");
        wire.insert("owner", "alice");
        let encoded = rmp_serde::to_vec_named(&wire).unwrap();

        let request = TransferRequest::decode(&encoded).unwrap();
        assert_eq!(request, TransferRequest::upload("alice", "notes"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let encoded = rmp_serde::to_vec_named(&Extra {
            message: "upload",
            filename: "notes",
            owner: "alice",
            mode: "append",
        })
        .unwrap();
        assert!(matches!(
            TransferRequest::decode(&encoded),
            Err(TransferError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut wire = BTreeMap::new();
        wire.insert("message", "rename");
        wire.insert("filename", "notes");
        wire.insert("owner", "alice");
        let encoded = rmp_serde::to_vec_named(&wire).unwrap();
        assert!(TransferRequest::decode(&encoded).is_err());
    }

    #[test]
    fn names_that_escape_the_files_directory_are_rejected() {
        for filename in ["", "..", "../etc", "a/b", "a\\b", "."] {
            let request = TransferRequest::upload("alice", filename);
            assert!(request.validate().is_err(), "{filename:?} accepted");
        }
        assert!(TransferRequest::upload("alice", "report.txt").validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let request = TransferRequest::download("bob", "alice", "notes", 0);
        assert!(request.validate().is_err());
    }

    #[test]
    fn chunks_larger_than_a_frame_are_rejected() {
        let at_limit = TransferRequest::download("bob", "alice", "notes", MAX_CHUNK_SIZE);
        assert!(at_limit.validate().is_ok());

        let encoded = TransferRequest::download("bob", "alice", "notes", MAX_CHUNK_SIZE + 1)
            .encode()
            .unwrap();
        assert!(matches!(
            TransferRequest::decode(&encoded),
            Err(TransferError::Protocol(_))
        ));
    }

    #[test]
    fn sanitize_keeps_ascii_alphanumerics() {
        assert_eq!(sanitize_alphanumeric("al!ce_99 "), "alce99");
        assert_eq!(sanitize_alphanumeric("émile"), "mile");
        assert_eq!(sanitize_alphanumeric("--"), "");
    }

    #[test]
    fn failure_messages_name_file_and_user() {
        assert_eq!(
            download_failed("notes", "alice"),
            "Download failed for file notes and user alice."
        );
        assert_eq!(
            upload_failed("notes", "alice"),
            "Upload failed for file notes and user alice."
        );
        assert_eq!(backing_file_name("alice", "notes"), "alice_notes");
    }
}
