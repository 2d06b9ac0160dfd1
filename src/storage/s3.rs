use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    config::Credentials,
    error::{DisplayErrorContext, ProvideErrorMetadata},
    primitives::ByteStream,
    types::{BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier},
    Client,
};
use futures::{stream, stream::BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, instrument};

use super::ObjectStore;
use crate::{config::StorageConfig, Error, ObjectDeletionError, Result};

/// The region S3 expects to be left out of a create request
const DEFAULT_REGION: &str = "us-east-1";

/// [`ObjectStore`] backed by any S3-compatible server
#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub async fn connect(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "bucket-operator",
        );

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .credentials_provider(credentials)
            .load()
            .await;

        // Most self-hosted backends do not serve virtual-hosted buckets
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        Self::new(Client::from_conf(s3_config))
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn backend_error<E>(operation: &'static str, err: E) -> Error
where
    E: std::error::Error,
{
    Error::BackendError {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(backend_error("head_bucket", err)),
        }
    }

    #[instrument(skip(self))]
    async fn make_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(bucket);
        if !region.is_empty() && region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        request
            .send()
            .await
            .map_err(|e| backend_error("create_bucket", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_bucket(&self, bucket: &str) -> Result<()> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| backend_error("delete_bucket", e))?;
        Ok(())
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<String>> {
        let client = self.client.clone();
        let bucket = bucket.to_string();
        let prefix = (!prefix.is_empty()).then(|| prefix.to_string());

        // State is the continuation token of the next page, `None` once the last page is read
        stream::try_unfold(Some(None::<String>), move |token| {
            let client = client.clone();
            let bucket = bucket.clone();
            let prefix = prefix.clone();

            async move {
                let Some(token) = token else {
                    return Ok(None);
                };

                let page = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .set_prefix(prefix)
                    .set_continuation_token(token)
                    .send()
                    .await
                    .map_err(|e| backend_error("list_objects", e))?;

                let keys: Vec<Result<String>> = page
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(|k| Ok(k.to_string())))
                    .collect();
                debug!(bucket = %bucket, count = keys.len(), "Listed page of objects");

                let next = if page.is_truncated().unwrap_or(false) {
                    page.next_continuation_token().map(|t| Some(t.to_string()))
                } else {
                    None
                };

                Ok::<_, Error>(Some((stream::iter(keys), next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn remove_objects(
        &self,
        bucket: &str,
        keys: Vec<String>,
    ) -> Result<Vec<ObjectDeletionError>> {
        let objects = keys
            .into_iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend_error("delete_objects", e))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| backend_error("delete_objects", e))?;

        let output = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| backend_error("delete_objects", e))?;

        Ok(output
            .errors()
            .iter()
            .map(|e| ObjectDeletionError {
                key: e.key().unwrap_or_default().to_string(),
                message: e
                    .message()
                    .or(e.code())
                    .unwrap_or("unknown error")
                    .to_string(),
            })
            .collect())
    }

    #[instrument(skip(self, body), fields(size = body.len()))]
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| backend_error("put_object", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_bucket_policy(&self, bucket: &str) -> Result<String> {
        match self.client.get_bucket_policy().bucket(bucket).send().await {
            Ok(output) => Ok(output.policy().unwrap_or_default().to_string()),
            Err(err) if err.code() == Some("NoSuchBucketPolicy") => Ok(String::new()),
            Err(err) => Err(backend_error("get_bucket_policy", err)),
        }
    }

    #[instrument(skip(self, policy))]
    async fn set_bucket_policy(&self, bucket: &str, policy: &str) -> Result<()> {
        self.client
            .put_bucket_policy()
            .bucket(bucket)
            .policy(policy)
            .send()
            .await
            .map_err(|e| backend_error("set_bucket_policy", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()> {
        self.client
            .delete_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| backend_error("delete_bucket_policy", e))?;
        Ok(())
    }
}
