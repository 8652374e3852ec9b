// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! URL / connection-string parsing into `OpenOptions` (spec §1 "out of
//! scope... reduced to a single `ObjectStore` interface"; spec §6 "URL
//! schemes", §8 testable property 8). This module only produces the parsed
//! option bag; turning it into a live `ObjectStore` is a backend concern
//! the core never sees.

use std::collections::HashMap;
use std::fmt;

/// Error raised by [`parse`]; carries the numeric `code` spec §6/§8 call for
/// (`-1` for an unrecognized connection-string key).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStringError {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for ConnectionStringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ConnectionStringError {}

fn invalid(message: impl Into<String>) -> ConnectionStringError {
    ConnectionStringError {
        code: -1,
        message: message.into(),
    }
}

/// Parsed `(bucket/container/dataset, key/blob/prefix)`-style open options,
/// one variant per URL scheme named in spec §6.
#[derive(Clone, Debug, PartialEq)]
pub enum OpenOptions {
    S3 {
        bucket: String,
        key: String,
        region: Option<String>,
        endpoint_override: Option<String>,
        access_key_id: Option<String>,
        secret_key: Option<String>,
        session_token: Option<String>,
    },
    Azure {
        container: String,
        blob: String,
        account_name: Option<String>,
        token: Option<String>,
    },
    AzureSas {
        host_path: String,
        signed_url: Option<String>,
    },
    Gs {
        bucket: String,
        prefix: String,
        json_credentials: Option<String>,
        credentials_file: Option<String>,
    },
    Sd {
        dataset_path: String,
        sd_authority_url: Option<String>,
        sd_api_key: Option<String>,
        sd_token: Option<String>,
    },
    Http {
        url: String,
        bearer_token: Option<String>,
    },
    File {
        path: String,
    },
    InMemory {
        name: String,
    },
}

/// Recognized connection-string keys (spec §6), matched case-insensitively.
const KNOWN_KEYS: &[&str] = &[
    "region",
    "endpointoverride",
    "accesskeyid",
    "secretkey",
    "sessiontoken",
    "bearertoken",
    "accountname",
    "token",
    "credentialsfile",
    "jsoncredentials",
    "signedurl",
    "sdauthorityurl",
    "sdapikey",
    "sdtoken",
];

/// `;`-separated `key=value` pairs, keys matched case-insensitively (spec
/// §6). An unknown key is a hard parse error (code `-1`) rather than being
/// silently ignored, since a typo'd credential key should never be mistaken
/// for "no credentials supplied".
fn parse_connection_string(connection_string: &str) -> Result<HashMap<String, String>, ConnectionStringError> {
    let mut out = HashMap::new();
    for pair in connection_string.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| invalid(format!("malformed connection-string entry '{pair}'")))?;
        let key_lower = key.trim().to_ascii_lowercase();
        if !KNOWN_KEYS.contains(&key_lower.as_str()) {
            return Err(invalid(format!("unknown connection-string key '{key}'")));
        }
        out.insert(key_lower, value.trim().to_string());
    }
    Ok(out)
}

/// Parses a `scheme://...` URL plus its connection string into `OpenOptions`
/// (spec §6, §8 testable property 8).
pub fn parse(url: &str, connection_string: &str) -> Result<OpenOptions, ConnectionStringError> {
    let opts = parse_connection_string(connection_string)?;
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| invalid(format!("'{url}' is not a valid VDS URL")))?;

    match scheme {
        "s3" => {
            let (bucket, key) = rest
                .split_once('/')
                .ok_or_else(|| invalid("s3:// URL must be 'bucket/key'"))?;
            Ok(OpenOptions::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
                region: opts.get("region").cloned(),
                endpoint_override: opts.get("endpointoverride").cloned(),
                access_key_id: opts.get("accesskeyid").cloned(),
                secret_key: opts.get("secretkey").cloned(),
                session_token: opts.get("sessiontoken").cloned(),
            })
        }
        "azure" => {
            let (container, blob) = rest
                .split_once('/')
                .ok_or_else(|| invalid("azure:// URL must be 'container/blob'"))?;
            Ok(OpenOptions::Azure {
                container: container.to_string(),
                blob: blob.to_string(),
                account_name: opts.get("accountname").cloned(),
                token: opts.get("token").cloned(),
            })
        }
        "azuresas" => Ok(OpenOptions::AzureSas {
            host_path: rest.to_string(),
            signed_url: opts.get("signedurl").cloned(),
        }),
        "gs" => {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            Ok(OpenOptions::Gs {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                json_credentials: opts.get("jsoncredentials").cloned(),
                credentials_file: opts.get("credentialsfile").cloned(),
            })
        }
        "sd" => Ok(OpenOptions::Sd {
            dataset_path: rest.to_string(),
            sd_authority_url: opts.get("sdauthorityurl").cloned(),
            sd_api_key: opts.get("sdapikey").cloned(),
            sd_token: opts.get("sdtoken").cloned(),
        }),
        "http" | "https" => Ok(OpenOptions::Http {
            url: url.to_string(),
            bearer_token: opts.get("bearertoken").cloned(),
        }),
        "file" => Ok(OpenOptions::File { path: rest.to_string() }),
        "inmemory" => Ok(OpenOptions::InMemory { name: rest.to_string() }),
        other => Err(invalid(format!("unsupported URL scheme '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_url_with_region() {
        let opts = parse("s3://bkt/key", "region=us-east-1").unwrap();
        assert_eq!(
            opts,
            OpenOptions::S3 {
                bucket: "bkt".into(),
                key: "key".into(),
                region: Some("us-east-1".into()),
                endpoint_override: None,
                access_key_id: None,
                secret_key: None,
                session_token: None,
            }
        );
    }

    #[test]
    fn unknown_key_is_code_negative_one() {
        let err = parse("s3://bkt/key", "banana=yes").unwrap_err();
        assert_eq!(err.code, -1);
    }

    #[test]
    fn keys_are_case_insensitive() {
        let opts = parse("s3://bkt/key", "REGION=eu-west-1").unwrap();
        match opts {
            OpenOptions::S3 { region, .. } => assert_eq!(region.as_deref(), Some("eu-west-1")),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn file_and_inmemory_schemes() {
        assert_eq!(
            parse("file:///tmp/dataset.vds", "").unwrap(),
            OpenOptions::File {
                path: "/tmp/dataset.vds".into()
            }
        );
        assert_eq!(
            parse("inmemory://mydata", "").unwrap(),
            OpenOptions::InMemory { name: "mydata".into() }
        );
    }
}
