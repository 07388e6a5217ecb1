//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use crate::{catalog::ShardStatus, controller::Controller, random::random_stream};
use bytes::Buf;
use futures::{Stream, TryStreamExt};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, io, sync::Arc};
use tokio_util::{
    io::{ReaderStream, StreamReader},
    sync::CancellationToken,
};
use uuid::Uuid;
use warp::{
    any, body, delete, filters::BoxedFilter, get, header, hyper,
    multipart::{self, FormData},
    path, post, reject, reply, Filter, Rejection, Reply,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Api(#[from] crate::error::Error),

    #[error("header 'Content-Length' is required")]
    LengthRequired,

    #[error("content length is too large")]
    ContentTooLarge,

    #[error("header 'Content-Disposition' is required")]
    DispositionRequired,

    #[error("unsupported file directories (`/`)")]
    LocationInvalid,

    #[error("failed to parse 'size' value: {0}")]
    SizeInvalid(String),

    #[error(
        "unable to download file. the file status is {0}. \
        you could remove and then upload this file again"
    )]
    FileDegraded(i32),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::Api(err) => match err {
                crate::error::Error::NotFound => StatusCode::NOT_FOUND,
                crate::error::Error::BadRequest(_) => StatusCode::BAD_REQUEST,
                crate::error::Error::AlreadyExists => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::LengthRequired => StatusCode::LENGTH_REQUIRED,
            Error::ContentTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Error::DispositionRequired => StatusCode::PRECONDITION_FAILED,
            Error::LocationInvalid | Error::SizeInvalid(_) => StatusCode::BAD_REQUEST,
            Error::FileDegraded(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024; // 10 GiB
const MAX_FORM_SIZE: u64 = 10 * 1024 * 1024;
const DOWNLOAD_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub struct ServerConfig {
    pub controller: Arc<Controller>,
    pub cancel: CancellationToken,
}

pub fn routes(config: ServerConfig) -> BoxedFilter<(impl Reply,)> {
    let ServerConfig { controller, cancel } = config;

    let controller = any().map(move || controller.clone());
    // per-request child of the process-wide token
    let cancel = any().map(move || cancel.child_token());

    // POST /api/v1/nodes
    let create_node = post()
        .and(path!("api" / "v1" / "nodes"))
        .and(controller.clone())
        .and(multipart::form().max_length(MAX_FORM_SIZE))
        .then(create_node)
        .map(handle_result)
        .boxed();

    // POST /api/v1/files
    let upload_file = post()
        .and(path!("api" / "v1" / "files"))
        .and(controller.clone())
        .and(header::optional("content-length"))
        .and(header::optional("content-disposition"))
        .and(body::stream())
        .then(upload_file)
        .map(handle_result)
        .boxed();

    // GET /api/v1/files/$location
    let download_file = get()
        .and(path!("api" / "v1" / "files" / String))
        .and(controller.clone())
        .then(download_file)
        .map(handle_result)
        .boxed();

    // DELETE /api/v1/files/$location
    let delete_file = delete()
        .and(path!("api" / "v1" / "files" / String))
        .and(controller.clone())
        .then(delete_file)
        .map(handle_result)
        .boxed();

    // GET /api/v1/tools/file-generator
    let generate_file = get()
        .and(path!("api" / "v1" / "tools" / "file-generator"))
        .and(warp::query::query())
        .and(cancel.clone())
        .then(generate_file)
        .map(handle_result)
        .boxed();

    let routes = create_node
        .or(upload_file)
        .or(download_file)
        .or(delete_file)
        .or(generate_file);

    routes
        .map(|reply| reply::with_header(reply, "server", "stria"))
        .recover(recover)
        .boxed()
}

async fn create_node(controller: Arc<Controller>, form: FormData) -> Result<impl Reply, Error> {
    let addr = read_form_field(form, "addr")
        .await
        .map_err(|err| {
            Error::Api(crate::error::Error::BadRequest(format!(
                "invalid multipart form: {err}"
            )))
        })?
        .unwrap_or_default();

    let node_id = controller.join_node(&addr).await?;

    #[derive(Serialize)]
    struct Response {
        node_id: Uuid,
    }

    Ok(reply::json(&Response { node_id }))
}

async fn upload_file<S, B>(
    controller: Arc<Controller>,
    length: Option<u64>,
    disposition: Option<String>,
    content: S,
) -> Result<impl Reply, Error>
where
    S: Stream<Item = Result<B, warp::Error>> + Send + Sync + 'static,
    B: Buf + Send + Sync + 'static,
{
    let size = length.unwrap_or(0);
    if size == 0 {
        return Err(Error::LengthRequired);
    }
    if size > MAX_FILE_SIZE {
        return Err(Error::ContentTooLarge);
    }

    let location = disposition
        .as_deref()
        .and_then(parse_content_disposition)
        .ok_or(Error::DispositionRequired)?;
    if location.contains('/') {
        return Err(Error::LocationInvalid);
    }

    let mut reader = Box::pin(StreamReader::new(
        content.map_err(|err| io::Error::new(io::ErrorKind::Other, err)),
    ));

    let file_id = controller
        .upload_file(&location, size as i64, &mut reader)
        .await?;

    #[derive(Serialize)]
    struct Response {
        file_id: Uuid,
        location: String,
        size: u64,
    }

    Ok(reply::with_status(
        reply::json(&Response {
            file_id,
            location,
            size,
        }),
        StatusCode::CREATED,
    ))
}

async fn download_file(
    location: String,
    controller: Arc<Controller>,
) -> Result<reply::Response, Error> {
    let found = controller.search_file(&location).await?;
    if found.status != ShardStatus::Ok {
        return Err(Error::FileDegraded(found.status as i32));
    }

    let (mut writer, reader) = tokio::io::duplex(DOWNLOAD_BUFFER_SIZE);
    let id = found.id;

    tokio::spawn(async move {
        // a failure here truncates the response; the client notices the
        // short body against the content-length header
        if let Err(err) = controller.download_file(id, &mut writer).await {
            warn!("download of file {id} failed mid-stream: {err}");
        }
    });

    let response = reply::Response::new(hyper::Body::wrap_stream(ReaderStream::new(reader)));

    Ok(attachment_headers(response, found.size, &location).into_response())
}

async fn delete_file(location: String, controller: Arc<Controller>) -> Result<impl Reply, Error> {
    #[derive(Serialize)]
    struct Response {
        deleted: bool,
    }
    let deleted = reply::json(&Response { deleted: true });

    // a file that is already gone deletes successfully
    let found = match controller.search_file(&location).await {
        Ok(found) => found,
        Err(crate::error::Error::NotFound) => return Ok(deleted),
        Err(err) => return Err(err.into()),
    };

    match controller.delete_file(found.id).await {
        Ok(()) | Err(crate::error::Error::NotFound) => Ok(deleted),
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Deserialize)]
struct GenerateQuery {
    name: Option<String>,
    size: Option<String>,
}

async fn generate_file(
    query: GenerateQuery,
    cancel: CancellationToken,
) -> Result<reply::Response, Error> {
    let size = query
        .size
        .as_deref()
        .unwrap_or("")
        .parse::<u64>()
        .map_err(|err| Error::SizeInvalid(err.to_string()))?;

    let name = query.name.unwrap_or_default();

    let response = reply::Response::new(hyper::Body::wrap_stream(random_stream(size, cancel)));

    Ok(attachment_headers(response, size as i64, &name).into_response())
}

fn attachment_headers(reply: impl Reply, size: i64, name: &str) -> impl Reply {
    let base = name.rsplit('/').next().unwrap_or(name);

    reply::with_header(
        reply::with_header(
            reply::with_header(reply, "content-length", size),
            "content-disposition",
            format!("attachment; filename=\"{base}\""),
        ),
        "content-type",
        "application/octet-stream",
    )
}

fn parse_content_disposition(value: &str) -> Option<String> {
    value
        .split(';')
        .find_map(|part| {
            part.trim()
                .strip_prefix("filename=")
                .map(|name| name.trim_matches('"').to_owned())
        })
        .filter(|name| !name.is_empty())
}

async fn read_form_field(form: FormData, name: &str) -> Result<Option<String>, warp::Error> {
    futures::pin_mut!(form);

    while let Some(part) = form.try_next().await? {
        if part.name() != name {
            continue;
        }

        let stream = part.stream();
        futures::pin_mut!(stream);

        let mut value = Vec::new();
        while let Some(mut chunk) = stream.try_next().await? {
            while chunk.has_remaining() {
                let bytes = chunk.chunk();
                value.extend_from_slice(bytes);
                let advanced = bytes.len();
                chunk.advance(advanced);
            }
        }

        return Ok(Some(String::from_utf8_lossy(&value).into_owned()));
    }

    Ok(None)
}

fn handle_result(result: Result<impl Reply, Error>) -> impl Reply {
    match result {
        Ok(reply) => reply.into_response(),
        Err(err) => {
            let status = err.status();
            if status.is_server_error() {
                warn!("{err}");
            }

            reply_error(status, err.to_string()).into_response()
        }
    }
}

async fn recover(err: Rejection) -> Result<impl Reply, Infallible> {
    Ok(if err.is_not_found() {
        reply_error(StatusCode::NOT_FOUND, "not found")
    } else if let Some(err) = err.find::<reject::InvalidHeader>() {
        reply_error(
            StatusCode::BAD_REQUEST,
            format!("invalid {} header", err.name()),
        )
    } else if let Some(err) = err.find::<reject::MissingHeader>() {
        reply_error(
            StatusCode::BAD_REQUEST,
            format!("missing {} header", err.name()),
        )
    } else if let Some(_) = err.find::<reject::InvalidQuery>() {
        reply_error(StatusCode::BAD_REQUEST, "invalid query string")
    } else if let Some(_) = err.find::<reject::MethodNotAllowed>() {
        reply_error(StatusCode::BAD_REQUEST, "method not allowed")
    } else if let Some(_) = err.find::<reject::PayloadTooLarge>() {
        reply_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
    } else if let Some(_) = err.find::<reject::UnsupportedMediaType>() {
        reply_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported content-type",
        )
    } else {
        warn!("unknown rejection: {err:?}");
        reply_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unknown error: {err:?}"),
        )
    })
}

fn reply_error(status: StatusCode, message: impl Into<String>) -> reply::Response {
    #[derive(Serialize)]
    struct ErrorBody {
        status: String,
        message: String,
    }

    reply::with_header(
        reply::with_status(
            reply::json(&ErrorBody {
                status: status.canonical_reason().unwrap_or("unknown").to_owned(),
                message: message.into(),
            }),
            status,
        ),
        "x-content-type-options",
        "nosniff",
    )
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_filename_is_extracted() {
        assert_eq!(
            parse_content_disposition("attachment; filename=\"report.bin\""),
            Some("report.bin".to_owned())
        );
        assert_eq!(
            parse_content_disposition("filename=plain.txt"),
            Some("plain.txt".to_owned())
        );
        assert_eq!(
            parse_content_disposition("form-data; name=\"file\"; filename=\"a b.dat\""),
            Some("a b.dat".to_owned())
        );
    }

    #[test]
    fn disposition_without_filename_is_rejected() {
        assert_eq!(parse_content_disposition("attachment"), None);
        assert_eq!(parse_content_disposition("attachment; filename=\"\""), None);
        assert_eq!(parse_content_disposition(""), None);
    }

    #[test]
    fn error_kinds_map_to_status_codes() {
        assert_eq!(
            Error::Api(crate::error::Error::NotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Api(crate::error::Error::BadRequest("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Api(crate::error::Error::AlreadyExists).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Api(crate::error::Error::Unknown("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(Error::LengthRequired.status(), StatusCode::LENGTH_REQUIRED);
        assert_eq!(
            Error::FileDegraded(3).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
