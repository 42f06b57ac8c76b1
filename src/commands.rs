//! Parsing of the interactive client's command lines.

use thiserror::Error;

use crate::messages::{LARGE_CHUNK, SMALL_CHUNK};

pub const HELP: &str = "Available commands:

Automates num_tests downloads for the given file. Stores the result in
a file labeled by experiment_name. Chunk size can be 'small' or 'large'.
--------
automate [experiment_name] [num_tests] [filename] [owner] [chunk_size]

Deletes the given file from the server.
--------
delete [filename]

Downloads the file specified that is owned by the given owner.
Chunk size can be 'small' or 'large'.
--------
download [filename] [owner] [chunk_size]

Lists the files you have access to along with their owners.
--------
files

Gives the user access to a file you uploaded.
--------
grant [filename] [username]

Lists the other clients.
--------
list

Revokes access to a file you uploaded.
--------
revoke [filename] [username]

Uploads a file to the server.
--------
upload [filename]

quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Automate {
        experiment: String,
        num_tests: usize,
        filename: String,
        owner: String,
        chunk_size: u32,
    },
    Delete {
        filename: String,
    },
    Download {
        filename: String,
        owner: String,
        chunk_size: u32,
    },
    Files,
    Grant {
        filename: String,
        subject: String,
    },
    Revoke {
        filename: String,
        subject: String,
    },
    Help,
    List,
    Quit,
    Upload {
        filename: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}")]
    Unknown(String),

    #[error("{command} takes {expected} words, got {actual}")]
    WrongArity {
        command: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("number of tests must be a positive integer, got {0:?}")]
    InvalidCount(String),
}

/// `large` selects the large chunk size; any other word the small one.
pub fn chunk_size_for(word: &str) -> u32 {
    if word == "large" {
        LARGE_CHUNK
    } else {
        SMALL_CHUNK
    }
}

pub fn parse_command(line: &str) -> Result<CliCommand, CommandError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&name) = tokens.first() else {
        return Err(CommandError::Empty);
    };

    let arity = |command: &'static str, expected: usize| {
        if tokens.len() == expected {
            Ok(())
        } else {
            Err(CommandError::WrongArity {
                command,
                expected,
                actual: tokens.len(),
            })
        }
    };

    match name {
        "automate" => {
            arity("automate", 6)?;
            let num_tests = tokens[2]
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| CommandError::InvalidCount(tokens[2].to_string()))?;
            Ok(CliCommand::Automate {
                experiment: tokens[1].to_string(),
                num_tests,
                filename: tokens[3].to_string(),
                owner: tokens[4].to_string(),
                chunk_size: chunk_size_for(tokens[5]),
            })
        }
        "delete" => {
            arity("delete", 2)?;
            Ok(CliCommand::Delete {
                filename: tokens[1].to_string(),
            })
        }
        "download" => {
            arity("download", 4)?;
            Ok(CliCommand::Download {
                filename: tokens[1].to_string(),
                owner: tokens[2].to_string(),
                chunk_size: chunk_size_for(tokens[3]),
            })
        }
        "grant" => {
            arity("grant", 3)?;
            Ok(CliCommand::Grant {
                filename: tokens[1].to_string(),
                subject: tokens[2].to_string(),
            })
        }
        "revoke" => {
            arity("revoke", 3)?;
            Ok(CliCommand::Revoke {
                filename: tokens[1].to_string(),
                subject: tokens[2].to_string(),
            })
        }
        "upload" => {
            arity("upload", 2)?;
            Ok(CliCommand::Upload {
                filename: tokens[1].to_string(),
            })
        }
        // These ignore extra words.
        "files" => Ok(CliCommand::Files),
        "list" => Ok(CliCommand::List),
        "help" => Ok(CliCommand::Help),
        "quit" => Ok(CliCommand::Quit),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}
