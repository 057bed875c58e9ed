use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use log::debug;
use tokio::io::AsyncWriteExt;

use mbdigest::Digest;

use crate::{BlobRef, BlobStore, BlobUri, Error, sharded_key};

/// S3-backed blob store. Credentials and region come from the ambient AWS
/// environment (env vars, profile, IMDS); nothing secret ends up in the
/// bundle index, only the canonical `s3://bucket/key` location.
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: &str, prefix: &str) -> S3BlobStore {
        S3BlobStore {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        }
    }

    pub async fn from_env(bucket: &str, prefix: &str) -> S3BlobStore {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket, prefix)
    }

    fn uri_for(&self, key: &str) -> Result<BlobUri, Error> {
        BlobUri::new("s3", &self.bucket, key)
    }

    fn resolve<'a>(&self, blob_ref: &'a BlobRef) -> Result<(&'a str, &'a str), Error> {
        blob_ref.uri.expect_scheme("s3")?;
        Ok((blob_ref.uri.container(), blob_ref.uri.key()))
    }

    async fn head_len(&self, bucket: &str, key: &str) -> Result<Option<i64>, Error> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(out.content_length().unwrap_or(0))),
            Err(e) => {
                let svc = e.into_service_error();
                if svc.is_not_found() {
                    Ok(None)
                } else {
                    Err(Error::Transport(svc.to_string()))
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, digest: &Digest, path: &Path) -> Result<BlobRef, Error> {
        let key = sharded_key(&self.prefix, digest);
        let local_len = std::fs::metadata(path)?.len() as i64;

        if let Some(remote_len) = self.head_len(&self.bucket, &key).await? {
            if remote_len != local_len {
                return Err(Error::Conflict(format!(
                    "s3://{}/{} exists with size {} != local {}",
                    self.bucket, key, remote_len, local_len
                )));
            }
            debug!("blob {} already in s3, skipping upload", digest.short());
            return Ok(BlobRef::new(self.uri_for(&key)?));
        }

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let out = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(BlobRef::with_etag(
            self.uri_for(&key)?,
            out.e_tag().map(str::to_string),
        ))
    }

    async fn get(&self, blob_ref: &BlobRef, dest: &Path) -> Result<(), Error> {
        let (bucket, key) = self.resolve(blob_ref)?;
        let out = match self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => out,
            Err(e) => {
                let svc = e.into_service_error();
                if svc.is_no_such_key() {
                    return Err(Error::NotFound(blob_ref.uri.to_string()));
                }
                return Err(Error::Transport(svc.to_string()));
            }
        };

        let parent = dest.parent().ok_or_else(|| {
            Error::Io(std::io::Error::other(format!("no parent for {dest:?}")))
        })?;
        std::fs::create_dir_all(parent)?;
        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        let mut file = tokio::io::BufWriter::new(tokio::fs::File::from_std(tmp.reopen()?));
        let mut body = out.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.into_inner().sync_all().await?;
        tmp.persist(dest).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    async fn exists(&self, blob_ref: &BlobRef) -> Result<bool, Error> {
        let (bucket, key) = self.resolve(blob_ref)?;
        Ok(self.head_len(bucket, key).await?.is_some())
    }
}
