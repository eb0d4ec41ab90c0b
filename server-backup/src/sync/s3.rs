//! S3 store backed by aws-sdk-s3.

use super::{ObjectEntry, RemoteStore, StoreConnector};
use crate::config::S3Config;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use std::sync::Arc;

/// DeleteObjects accepts at most this many keys per request.
const DELETE_BATCH: usize = 1000;

/// Builds clients from the shared AWS config chain, narrowed by the server's
/// `profile`, `region` and `endpoint`.
pub struct S3Connector;

#[async_trait]
impl StoreConnector for S3Connector {
    async fn open(&self, config: &S3Config) -> Result<Arc<dyn RemoteStore>> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        // Custom endpoints get path-style addressing.
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.endpoint.is_some())
            .build();

        tracing::debug!(bucket = %config.bucket, profile = ?config.profile, "Opened object store client");
        Ok(Arc::new(S3Store {
            client: Client::from_conf(s3_config),
        }))
    }
}

pub struct S3Store {
    client: Client,
}

fn store_error(action: &str, bucket: &str, err: impl std::error::Error) -> BackupError {
    BackupError::Store(format!("{} on {}: {}", action, bucket, DisplayErrorContext(err)))
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(store_error("HeadBucket", bucket, e)),
        }
    }

    async fn list(&self, bucket: &str) -> Result<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| store_error("ListObjectsV2", bucket, e))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    entries.push(ObjectEntry {
                        key: key.to_string(),
                        size: object.size().unwrap_or_default(),
                    });
                }
            }
        }

        Ok(entries)
    }

    async fn put(&self, bucket: &str, key: &str, file: tokio::fs::File) -> Result<()> {
        let body = ByteStream::read_from()
            .file(file)
            .build()
            .await
            .map_err(|e| store_error("PutObject", bucket, e))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| store_error("PutObject", bucket, e))?;
        Ok(())
    }

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for chunk in keys.chunks(DELETE_BATCH) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_error("DeleteObjects", bucket, e))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| store_error("DeleteObjects", bucket, e))?;

            let output = self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| store_error("DeleteObjects", bucket, e))?;

            if let Some(failed) = output.errors().first() {
                return Err(BackupError::Store(format!(
                    "DeleteObjects on {}: {} of {} keys failed, first {}: {}",
                    bucket,
                    output.errors().len(),
                    chunk.len(),
                    failed.key().unwrap_or_default(),
                    failed.message().unwrap_or_default(),
                )));
            }
        }
        Ok(())
    }
}
