//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use sqlx::error::DatabaseError;
use std::io;

/// Domain-level error kinds shared by the catalog, the node wire protocol
/// and the controller. The HTTP layer translates kinds into status codes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resource not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("resource already exists")]
    AlreadyExists,

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Unknown(String),
}

// postgres condition codes worth distinguishing; everything else is Unknown
const NOT_NULL_VIOLATION: &str = "23502";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";
const UNIQUE_VIOLATION: &str = "23505";
const EXCLUSION_VIOLATION: &str = "23P01";

impl Error {
    fn from_sqlstate(code: &str, message: String) -> Self {
        match code {
            NOT_NULL_VIOLATION | FOREIGN_KEY_VIOLATION | CHECK_VIOLATION => {
                Error::BadRequest(message)
            }
            UNIQUE_VIOLATION | EXCLUSION_VIOLATION => Error::AlreadyExists,
            _ => Error::Unknown(message),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound,
            sqlx::Error::Database(err) => match err.code() {
                Some(code) => Error::from_sqlstate(&code, err.to_string()),
                None => Error::Unknown(err.to_string()),
            },
            err => Error::Unknown(err.to_string()),
        }
    }
}
