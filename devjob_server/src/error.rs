use devjob_lib::JobError;
use rocket::{http::Status, response::status};
use tracing::error;

pub type ApiResult<T> = Result<T, status::Custom<String>>;

/// maps a pool failure to its HTTP status, the message becomes the body
pub fn reject(err: JobError) -> status::Custom<String> {
    let status = match &err {
        JobError::BadRequest(_) => Status::BadRequest,
        JobError::Conflict(_) | JobError::DuplicateJob(_) => Status::Conflict,
        JobError::NotFound(_) => Status::NotFound,
        JobError::Gone(_) => Status::Gone,
        JobError::Spawn(_) | JobError::Io(_) | JobError::Metadata(_) => {
            error!("request failed: {}", err);
            Status::InternalServerError
        }
    };
    status::Custom(status, err.to_string())
}
