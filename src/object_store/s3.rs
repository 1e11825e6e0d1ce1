//! Amazon S3 object store.
//!
//! Each tenant bucket maps to an S3 bucket of the same name:
//! ```text
//! s3://{bucket}/{key}
//! ```

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::create_bucket::CreateBucketError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_bucket::HeadBucketError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{validate_key, ObjectMeta, ObjectStore, ObjectStoreError, Result};

/// S3-based object store.
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Create a new S3 object store.
    ///
    /// Uses default credentials from the environment (AWS_ACCESS_KEY_ID,
    /// AWS_SECRET_ACCESS_KEY, or IAM role).
    pub async fn new() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: Client::new(&config),
        }
    }

    /// Create with custom endpoint (for S3-compatible services like MinIO).
    pub async fn with_endpoint(endpoint: &str, region: Option<&str>) -> Self {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = region {
            config_loader = config_loader.region(aws_config::Region::new(region.to_string()));
        }

        let config = config_loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .endpoint_url(endpoint)
            .force_path_style(true) // Required for MinIO and most S3-compatible services
            .build();

        Self {
            client: Client::from_conf(s3_config),
        }
    }

    /// Create with explicit client (for testing).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

type S3Error<E> = SdkError<E, HttpResponse>;

/// HTTP status of the response behind a failed request, if one arrived.
fn status_of<E>(e: &S3Error<E>) -> Option<u16> {
    e.raw_response().map(|r| r.status().as_u16())
}

fn error_code<E: ProvideErrorMetadata>(e: &S3Error<E>) -> Option<&str> {
    e.as_service_error().and_then(|se| se.code())
}

fn not_found(bucket: &str, key: &str) -> ObjectStoreError {
    ObjectStoreError::NotFound {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

fn get_error(bucket: &str, key: &str, e: S3Error<GetObjectError>) -> ObjectStoreError {
    if e.as_service_error().is_some_and(GetObjectError::is_no_such_key) || status_of(&e) == Some(404) {
        not_found(bucket, key)
    } else {
        ObjectStoreError::Unavailable(format!("S3 download failed: {}", e))
    }
}

/// Whether a HEAD on an object found nothing. HEAD responses carry no
/// error body, so the status is all there is.
fn head_object_missing(e: &S3Error<HeadObjectError>) -> bool {
    e.as_service_error().is_some_and(HeadObjectError::is_not_found) || status_of(e) == Some(404)
}

fn head_bucket_missing(e: &S3Error<HeadBucketError>) -> bool {
    e.as_service_error().is_some_and(HeadBucketError::is_not_found) || status_of(e) == Some(404)
}

fn put_error(bucket: &str, e: S3Error<PutObjectError>) -> ObjectStoreError {
    if error_code(&e) == Some("NoSuchBucket") {
        ObjectStoreError::BucketNotFound(bucket.to_string())
    } else {
        ObjectStoreError::Unavailable(format!("S3 upload failed: {}", e))
    }
}

fn to_utc(ts: &aws_sdk_s3::primitives::DateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos()).unwrap_or_default()
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if head_bucket_missing(&e) {
                    Ok(false)
                } else {
                    Err(ObjectStoreError::Unavailable(format!(
                        "S3 head bucket failed: {}",
                        e
                    )))
                }
            }
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                debug!(bucket = %bucket, "Created S3 bucket");
                Ok(())
            }
            Err(e) => {
                if e
                    .as_service_error()
                    .is_some_and(CreateBucketError::is_bucket_already_owned_by_you)
                {
                    Ok(())
                } else {
                    Err(ObjectStoreError::Unavailable(format!(
                        "S3 create bucket failed: {}",
                        e
                    )))
                }
            }
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    if e
                        .as_service_error()
                        .is_some_and(ListObjectsV2Error::is_no_such_bucket)
                    {
                        return Ok(Vec::new());
                    }
                    return Err(ObjectStoreError::Unavailable(format!(
                        "S3 list failed: {}",
                        e
                    )));
                }
            };

            for object in response.contents() {
                if let (Some(key), Some(last_modified)) = (object.key(), object.last_modified()) {
                    objects.push(ObjectMeta {
                        key: key.to_string(),
                        last_modified: to_utc(last_modified),
                        size: object.size().unwrap_or_default().max(0) as u64,
                    });
                }
            }

            continuation_token = response.next_continuation_token().map(|s| s.to_string());
            if continuation_token.is_none() {
                break;
            }
        }

        Ok(objects)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| get_error(bucket, key, e))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Unavailable(format!("S3 body read failed: {}", e)))?
            .into_bytes();

        Ok(body)
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        validate_key(key)?;
        let size = body.len();

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| put_error(bucket, e))?;

        debug!(bucket = %bucket, key = %key, size, "Stored object in S3");
        Ok(())
    }

    /// S3 deletes succeed on missing keys, so existence is checked first.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        if let Err(e) = self.client.head_object().bucket(bucket).key(key).send().await {
            return Err(if head_object_missing(&e) {
                not_found(bucket, key)
            } else {
                ObjectStoreError::Unavailable(format!("S3 head object failed: {}", e))
            });
        }

        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Unavailable(format!("S3 delete failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use aws_sdk_s3::error::ErrorMetadata;
    use aws_sdk_s3::primitives::SdkBody;
    use aws_sdk_s3::types::error::{NoSuchKey, NotFound};

    fn service_error<E>(err: E, status: u16) -> S3Error<E> {
        SdkError::service_error(
            err,
            HttpResponse::new(status.try_into().unwrap(), SdkBody::empty()),
        )
    }

    #[test]
    fn test_missing_key_maps_to_not_found() {
        let e = service_error(GetObjectError::NoSuchKey(NoSuchKey::builder().build()), 404);
        assert!(matches!(get_error("b", "k", e), ObjectStoreError::NotFound { .. }));
    }

    #[test]
    fn test_other_get_failures_are_unavailable() {
        let e = service_error(GetObjectError::generic(ErrorMetadata::builder().code("AccessDenied").build()), 403);
        assert!(matches!(get_error("b", "k", e), ObjectStoreError::Unavailable(_)));
    }

    #[test]
    fn test_head_object_not_found() {
        let e = service_error(HeadObjectError::NotFound(NotFound::builder().build()), 404);
        assert!(head_object_missing(&e));

        let e = service_error(HeadObjectError::generic(ErrorMetadata::builder().code("SlowDown").build()), 503);
        assert!(!head_object_missing(&e));
    }

    #[test]
    fn test_put_into_missing_bucket() {
        let e = service_error(
            PutObjectError::generic(ErrorMetadata::builder().code("NoSuchBucket").build()),
            404,
        );
        assert!(matches!(put_error("b", e), ObjectStoreError::BucketNotFound(_)));
    }

    #[test]
    fn test_to_utc_conversion() {
        let ts = aws_sdk_s3::primitives::DateTime::from_secs(1_735_689_600);
        assert_eq!(to_utc(&ts).to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
