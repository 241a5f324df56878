use std::collections::VecDeque;
use std::io::Read;
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use snapvault_types::{Result, SnapvaultError};

use crate::retry::is_retryable_http;
use crate::{classify_io, KeyListing, S3Settings, StorageBackend};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

const DEFAULT_REGION: &str = "us-east-1";

/// Destination backed by an S3-compatible bucket.
///
/// Backends do not retry; the upload coordinator and restore pipeline wrap
/// every call in the retry controller.
pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    /// Prefix (root path) prepended to all keys.
    root: String,
    label: String,
}

impl S3Backend {
    pub fn new(uri: &str, bucket_name: &str, root: &str, settings: &S3Settings) -> Result<Self> {
        let region = settings
            .region
            .clone()
            .or_else(|| std::env::var("AWS_REGION").ok())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let custom_endpoint = settings
            .endpoint
            .clone()
            .or_else(|| std::env::var("AWS_S3_CUSTOM_ENDPOINT").ok());
        let access_key_id = settings
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .ok_or_else(|| {
                SnapvaultError::Config(format!("{uri}: no S3 access key id configured"))
            })?;
        let secret_access_key = settings
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .ok_or_else(|| {
                SnapvaultError::Config(format!("{uri}: no S3 secret access key configured"))
            })?;

        // Custom endpoints (MinIO, Ceph, ...) generally need path-style addressing.
        let (endpoint, url_style) = match custom_endpoint {
            Some(endpoint) => (endpoint, UrlStyle::Path),
            None => (
                format!("https://s3.{region}.amazonaws.com"),
                UrlStyle::VirtualHost,
            ),
        };
        let base_url = endpoint.parse().map_err(|e| {
            SnapvaultError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}"))
        })?;

        let bucket = Bucket::new(base_url, url_style, bucket_name.to_string(), region)
            .map_err(|e| SnapvaultError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let credentials = Credentials::new(access_key_id, secret_access_key);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials,
            agent,
            root: root.trim_matches('/').to_string(),
            label: uri.to_string(),
        })
    }

    /// Prepend the root prefix to a key.
    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn strip_root<'k>(&self, key: &'k str) -> &'k str {
        if self.root.is_empty() {
            return key;
        }
        key.strip_prefix(&self.root)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(key)
    }

    fn context(&self, op: &str, key: &str) -> String {
        format!("{} {op} {key}", self.label)
    }

    fn fetch_page(&self, prefix: &str, token: Option<&str>) -> Result<(Vec<String>, Option<String>)> {
        let full_prefix = self.full_key(prefix);
        let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
        action.query_mut().insert("prefix", &full_prefix);
        if let Some(token) = token {
            action.query_mut().insert("continuation-token", token);
        }
        let url = action.sign(PRESIGN_DURATION);

        let context = self.context("LIST", prefix);
        let resp = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|e| classify_http(context.clone(), e))?;
        let mut body = Vec::new();
        resp.into_reader()
            .read_to_end(&mut body)
            .map_err(|e| classify_io(context.clone(), e))?;
        let body = std::str::from_utf8(&body).map_err(|e| {
            SnapvaultError::fatal(context.clone(), format!("failed to parse response: {e}"))
        })?;
        let parsed = ListObjectsV2::parse_response(body).map_err(|e| {
            SnapvaultError::fatal(context.clone(), format!("failed to parse response: {e}"))
        })?;

        let keys = parsed
            .contents
            .iter()
            // Skip directory markers.
            .filter(|obj| !obj.key.ends_with('/'))
            .map(|obj| self.strip_root(&obj.key).to_string())
            .collect();
        Ok((keys, parsed.next_continuation_token))
    }
}

/// Map a ureq failure to the storage error taxonomy.
pub(crate) fn classify_http(context: String, err: ureq::Error) -> SnapvaultError {
    match err {
        ureq::Error::Status(404, _) => SnapvaultError::NotFound(context),
        ref e if is_retryable_http(e) => SnapvaultError::transient(context, e),
        ureq::Error::Status(code, resp) => SnapvaultError::fatal(
            context,
            format!("HTTP {code} {}", resp.status_text()),
        ),
        ureq::Error::Transport(t) => SnapvaultError::transient(context, t),
    }
}

/// Paginated listing that fetches the next page only when the current one
/// is exhausted.
struct S3Listing<'a> {
    backend: &'a S3Backend,
    prefix: String,
    page: VecDeque<String>,
    next_token: Option<String>,
    started: bool,
    finished: bool,
}

impl Iterator for S3Listing<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.page.pop_front() {
                return Some(Ok(key));
            }
            if self.finished || (self.started && self.next_token.is_none()) {
                return None;
            }
            self.started = true;
            match self
                .backend
                .fetch_page(&self.prefix, self.next_token.as_deref())
            {
                Ok((keys, token)) => {
                    self.page.extend(keys);
                    self.next_token = token;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl StorageBackend for S3Backend {
    fn put(&self, key: &str, size_hint: u64, reader: &mut dyn Read) -> Result<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);

        self.agent
            .put(url.as_str())
            .set("Content-Length", &size_hint.to_string())
            .send(reader)
            .map_err(|e| classify_http(self.context("PUT", key), e))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);

        let resp = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|e| classify_http(self.context("GET", key), e))?;
        Ok(Box::new(resp.into_reader()))
    }

    fn list(&self, prefix: &str) -> Result<KeyListing<'_>> {
        Ok(Box::new(S3Listing {
            backend: self,
            prefix: prefix.to_string(),
            page: VecDeque::new(),
            next_token: None,
            started: false,
            finished: false,
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);

        match self.agent.delete(url.as_str()).call() {
            Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(classify_http(self.context("DELETE", key), e)),
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> S3Settings {
        S3Settings {
            region: Some("eu-west-1".into()),
            endpoint: Some("http://127.0.0.1:9000".into()),
            access_key_id: Some("AKIDEXAMPLE".into()),
            secret_access_key: Some("secret".into()),
        }
    }

    #[test]
    fn root_prefix_is_applied_and_stripped() {
        let b = S3Backend::new("s3://bucket/nightly", "bucket", "/nightly/", &settings()).unwrap();
        assert_eq!(b.full_key("manifests/x"), "nightly/manifests/x");
        assert_eq!(b.strip_root("nightly/manifests/x"), "manifests/x");

        let bare = S3Backend::new("s3://bucket", "bucket", "", &settings()).unwrap();
        assert_eq!(bare.full_key("k"), "k");
        assert_eq!(bare.strip_root("k"), "k");
    }

    #[test]
    fn invalid_endpoint_is_config_error() {
        let mut s = settings();
        s.endpoint = Some("not a url".into());
        assert!(matches!(
            S3Backend::new("s3://bucket", "bucket", "", &s),
            Err(SnapvaultError::Config(_))
        ));
    }

    #[test]
    fn transport_errors_are_transient() {
        let b = S3Backend::new("s3://bucket", "bucket", "", &settings()).unwrap();
        // Nothing listens on port 1.
        let err = b
            .agent
            .get("http://127.0.0.1:1/")
            .call()
            .expect_err("connection must fail");
        assert!(classify_http("ctx".into(), err).is_transient());
    }
}
