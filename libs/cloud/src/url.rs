//! Backend URLs.
//!
//! - Queues: `sqs://NAME` or `dir:///path/to/spool`
//! - Stores: `s3://BUCKET[/PREFIX]` or `file:///path/to/dir`
//! - Objects (single files to fetch): `s3://BUCKET/KEY` or `file:///path`

use std::fmt;
use std::path::PathBuf;

use crate::error::CloudError;

/// Where a work queue lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueLocation {
    Sqs { name: String },
    Dir(PathBuf),
}

impl QueueLocation {
    pub fn parse(url: &str) -> Result<Self, CloudError> {
        if let Some(name) = url.strip_prefix("sqs://") {
            if name.is_empty() || name.contains('/') {
                return Err(CloudError::invalid_url(url, "expected sqs://QUEUE_NAME"));
            }
            Ok(Self::Sqs {
                name: name.to_string(),
            })
        } else if let Some(path) = url.strip_prefix("dir://") {
            if path.is_empty() {
                return Err(CloudError::invalid_url(url, "expected dir:///path"));
            }
            Ok(Self::Dir(PathBuf::from(path)))
        } else {
            Err(CloudError::invalid_url(
                url,
                "work queue must be an sqs:// or dir:// URL",
            ))
        }
    }
}

impl fmt::Display for QueueLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqs { name } => write!(f, "sqs://{name}"),
            Self::Dir(path) => write!(f, "dir://{}", path.display()),
        }
    }
}

/// Where rendered output is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Prefix is empty or ends in `/`.
    S3 { bucket: String, prefix: String },
    Local(PathBuf),
}

impl StoreLocation {
    pub fn parse(url: &str) -> Result<Self, CloudError> {
        if let Some(rest) = url.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(CloudError::invalid_url(url, "missing bucket name"));
            }
            let mut prefix = prefix.to_string();
            if !prefix.is_empty() && !prefix.ends_with('/') {
                prefix.push('/');
            }
            Ok(Self::S3 {
                bucket: bucket.to_string(),
                prefix,
            })
        } else if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                return Err(CloudError::invalid_url(url, "expected file:///path"));
            }
            Ok(Self::Local(PathBuf::from(path)))
        } else {
            Err(CloudError::invalid_url(
                url,
                "output location must be an s3:// or file:// URL",
            ))
        }
    }

    /// URL of an object stored under `name`.
    pub fn url_for(&self, name: &str) -> String {
        match self {
            Self::S3 { bucket, prefix } => format!("s3://{bucket}/{prefix}{name}"),
            Self::Local(root) => format!("file://{}", root.join(name).display()),
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S3 { bucket, prefix } => write!(f, "s3://{bucket}/{prefix}"),
            Self::Local(root) => write!(f, "file://{}", root.display()),
        }
    }
}

/// A single remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLocation {
    S3 { bucket: String, key: String },
    Local(PathBuf),
}

impl ObjectLocation {
    pub fn parse(url: &str) -> Result<Self, CloudError> {
        if let Some(rest) = url.strip_prefix("s3://") {
            match rest.split_once('/') {
                Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self::S3 {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }),
                _ => Err(CloudError::invalid_url(url, "expected s3://BUCKET/KEY")),
            }
        } else if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                return Err(CloudError::invalid_url(url, "expected file:///path"));
            }
            Ok(Self::Local(PathBuf::from(path)))
        } else {
            Err(CloudError::invalid_url(url, "expected an s3:// or file:// URL"))
        }
    }

    /// The store an object can be fetched through.
    pub fn store_location(&self) -> StoreLocation {
        match self {
            Self::S3 { bucket, .. } => StoreLocation::S3 {
                bucket: bucket.clone(),
                prefix: String::new(),
            },
            Self::Local(path) => StoreLocation::Local(
                path.parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/")),
            ),
        }
    }

    /// Last path component, used as the local file name of a download.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::S3 { key, .. } => key.rsplit('/').next().filter(|s| !s.is_empty()),
            Self::Local(path) => path.file_name().and_then(|s| s.to_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("sqs://frames", QueueLocation::Sqs { name: "frames".into() })]
    #[case("dir:///var/spool/farm", QueueLocation::Dir("/var/spool/farm".into()))]
    fn test_queue_location(#[case] url: &str, #[case] expected: QueueLocation) {
        let parsed = QueueLocation::parse(url).unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), url);
    }

    #[rstest]
    #[case("http://frames")]
    #[case("sqs://")]
    #[case("sqs://a/b")]
    fn test_queue_location_rejects(#[case] url: &str) {
        assert!(QueueLocation::parse(url).is_err());
    }

    #[rstest]
    #[case("s3://renders", "renders", "")]
    #[case("s3://renders/", "renders", "")]
    #[case("s3://renders/shot1", "renders", "shot1/")]
    #[case("s3://renders/shot1/", "renders", "shot1/")]
    fn test_store_location_prefix(
        #[case] url: &str,
        #[case] bucket: &str,
        #[case] prefix: &str,
    ) {
        assert_eq!(
            StoreLocation::parse(url).unwrap(),
            StoreLocation::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            }
        );
    }

    #[test]
    fn test_store_url_for() {
        let s3 = StoreLocation::parse("s3://renders/shot1").unwrap();
        assert_eq!(s3.url_for("frame_0001.png"), "s3://renders/shot1/frame_0001.png");

        let local = StoreLocation::parse("file:///srv/out").unwrap();
        assert_eq!(local.url_for("a.png"), "file:///srv/out/a.png");
    }

    #[test]
    fn test_object_location() {
        let obj = ObjectLocation::parse("s3://projects/shots/proj.tar.gz").unwrap();
        assert_eq!(obj.file_name(), Some("proj.tar.gz"));
        assert!(ObjectLocation::parse("s3://projects").is_err());

        let local = ObjectLocation::parse("file:///srv/proj.zip").unwrap();
        assert_eq!(local.file_name(), Some("proj.zip"));
        assert_eq!(
            local.store_location(),
            StoreLocation::Local(PathBuf::from("/srv"))
        );
        assert_eq!(
            obj.store_location().to_string(),
            "s3://projects/".to_string()
        );
    }
}
