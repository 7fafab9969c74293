// dbbackup/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

const MIB: u64 = 1024 * 1024;

/// Files at or above this size go through a multipart upload.
pub const MULTIPART_THRESHOLD: u64 = 8 * MIB;
pub const MIN_PART_SIZE: u64 = 8 * MIB;
/// S3 limits: parts per upload and total object size (5 TiB).
pub const MAX_PARTS: u64 = 10_000;
pub const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * MIB;

/// Settings understood from `S3_FLAGS`. Flags may be written as
/// `--flag value` or `--flag=value`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Options {
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub storage_class: Option<String>,
}

impl S3Options {
    pub fn parse(flags: &[String]) -> Self {
        let mut options = S3Options::default();
        let mut iter = flags.iter();
        while let Some(flag) = iter.next() {
            let (name, inline) = match flag.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (flag.as_str(), None),
            };
            let slot = match name {
                "--endpoint-url" => &mut options.endpoint_url,
                "--region" => &mut options.region,
                "--storage-class" => &mut options.storage_class,
                _ => {
                    warn!("Ignoring unsupported S3 option: {}", flag);
                    continue;
                }
            };
            match inline.or_else(|| iter.next().cloned()) {
                Some(value) => *slot = Some(value),
                None => warn!("S3 option {} is missing a value", name),
            }
        }
        options
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpan {
    pub number: i32,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPlan {
    Single,
    Multipart(Vec<PartSpan>),
}

/// Chooses between a single `PutObject` and a multipart upload for a file of
/// `size` bytes. Parts are contiguous; all but the last share one size, which
/// grows past [`MIN_PART_SIZE`] in whole MiB when needed to stay within
/// [`MAX_PARTS`].
pub fn plan_upload(size: u64) -> Result<UploadPlan> {
    if size > MAX_OBJECT_SIZE {
        anyhow::bail!("{} bytes exceeds the S3 object size limit of 5 TiB", size);
    }
    if size < MULTIPART_THRESHOLD {
        return Ok(UploadPlan::Single);
    }

    let part_size = MIN_PART_SIZE.max(size.div_ceil(MAX_PARTS).next_multiple_of(MIB));
    let parts = (0..size.div_ceil(part_size))
        .map(|index| -> Result<PartSpan> {
            let offset = index * part_size;
            Ok(PartSpan {
                number: i32::try_from(index + 1)?,
                offset,
                length: part_size.min(size - offset),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(UploadPlan::Multipart(parts))
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads `file` to `bucket`/`key`.
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        file: &Path,
        options: &S3Options,
    ) -> Result<()>;
}

/// S3-compatible store reached through the AWS SDK. Credentials come from the
/// default provider chain (environment, profile, instance role).
#[derive(Debug, Default)]
pub struct AwsObjectStore;

#[async_trait]
impl ObjectStore for AwsObjectStore {
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        file: &Path,
        options: &S3Options,
    ) -> Result<()> {
        let size = tokio::fs::metadata(file)
            .await
            .with_context(|| format!("Failed to read metadata of {}", file.display()))?
            .len();
        info!("Uploading {} ({} bytes) to s3://{}/{}", file.display(), size, bucket, key);

        let client = build_client(options).await;
        match plan_upload(size)? {
            UploadPlan::Single => put_single(&client, bucket, key, file, options).await?,
            UploadPlan::Multipart(parts) => {
                put_multipart(&client, bucket, key, file, &parts, options).await?
            }
        }

        info!("✅ Uploaded {} to s3://{}/{}", file.display(), bucket, key);
        Ok(())
    }
}

async fn build_client(options: &S3Options) -> s3::Client {
    let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
    if let Some(endpoint) = &options.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    if let Some(region) = &options.region {
        loader = loader.region(Region::new(region.clone()));
    }
    let sdk_config = loader.load().await;

    // Custom endpoints (MinIO, Spaces) generally need path-style addressing.
    let s3_config = s3::config::Builder::from(&sdk_config)
        .force_path_style(options.endpoint_url.is_some())
        .build();
    s3::Client::from_conf(s3_config)
}

fn storage_class(options: &S3Options) -> Option<StorageClass> {
    options.storage_class.as_deref().map(StorageClass::from)
}

async fn put_single(
    client: &s3::Client,
    bucket: &str,
    key: &str,
    file: &Path,
    options: &S3Options,
) -> Result<()> {
    let body = ByteStream::from_path(file)
        .await
        .with_context(|| format!("Failed to create ByteStream from file: {}", file.display()))?;

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .set_storage_class(storage_class(options))
        .send()
        .await
        .with_context(|| {
            format!(
                "Failed to upload file {} to S3 bucket {} with key {}",
                file.display(),
                bucket,
                key
            )
        })?;
    Ok(())
}

/// Aborts the upload on any failure so no orphaned parts are billed.
async fn put_multipart(
    client: &s3::Client,
    bucket: &str,
    key: &str,
    file: &Path,
    parts: &[PartSpan],
    options: &S3Options,
) -> Result<()> {
    let created = client
        .create_multipart_upload()
        .bucket(bucket)
        .key(key)
        .set_storage_class(storage_class(options))
        .send()
        .await
        .with_context(|| format!("Failed to start multipart upload to s3://{}/{}", bucket, key))?;
    let upload_id = created
        .upload_id()
        .context("S3 did not return a multipart upload id")?
        .to_string();
    info!("Multipart upload {} started with {} part(s)", upload_id, parts.len());

    let result: Result<()> = async {
        let completed = upload_parts(client, bucket, key, &upload_id, file, parts).await?;
        client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to complete multipart upload {}", upload_id))?;
        Ok(())
    }
    .await;

    if result.is_err() {
        if let Err(e) = client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .send()
            .await
        {
            warn!("Failed to abort multipart upload {}: {}", upload_id, e);
        }
    }
    result
}

async fn upload_parts(
    client: &s3::Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    file: &Path,
    parts: &[PartSpan],
) -> Result<Vec<CompletedPart>> {
    let mut reader = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let mut completed = Vec::with_capacity(parts.len());

    for part in parts {
        let mut buffer = vec![0u8; usize::try_from(part.length)?];
        reader.seek(SeekFrom::Start(part.offset)).await?;
        reader
            .read_exact(&mut buffer)
            .await
            .with_context(|| format!("Failed to read part {} of {}", part.number, file.display()))?;

        let output = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part.number)
            .body(ByteStream::from(buffer))
            .send()
            .await
            .with_context(|| format!("Failed to upload part {} of {}", part.number, key))?;
        let e_tag = output
            .e_tag()
            .with_context(|| format!("S3 returned no ETag for part {}", part.number))?;

        completed.push(
            CompletedPart::builder()
                .part_number(part.number)
                .e_tag(e_tag)
                .build(),
        );
        debug!("Uploaded part {}/{}", part.number, parts.len());
    }
    Ok(completed)
}
