//!
//! # 对象存储
//! Read access to the object store that holds the original photos.
//!

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use headers::HeaderMapExt;
use reqwest::{Client, Request, StatusCode};
use url::Url;

use crate::archive::error::StorageError;

/// An open object body. Dropping it cancels the transfer and releases the
/// underlying connection.
pub struct ObjectStream {
    /// Length announced by the store, if any
    pub len: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, StorageError>>,
}

pub trait ObjectStorage: Send + Sync + 'static {
    fn open_read_stream<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<ObjectStream, StorageError>>;
}

/// Plain HTTP GET against `base_url/key`, e.g. a public or presigned bucket
pub struct HttpObjectStorage {
    client: Client,
    base_url: Url,
}

impl HttpObjectStorage {
    pub fn new(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    pub fn object_url(&self, key: &str) -> Result<Url, StorageError> {
        let key = key.trim_start_matches('/');
        if key.is_empty() || key.split('/').any(|segment| segment == "..") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        self.base_url
            .join(key)
            .map_err(|_| StorageError::InvalidKey(key.to_string()))
    }

    fn create_http_request(&self, url: Url) -> Request {
        let mut request = Request::new(reqwest::Method::GET, url);
        let header_map = request.headers_mut();

        header_map.insert(reqwest::header::ACCEPT, headers::HeaderValue::from_static("*/*"));
        header_map.typed_insert(headers::Connection::keep_alive());

        request
    }

    async fn open(&self, key: &str) -> Result<ObjectStream, StorageError> {
        let request = self.create_http_request(self.object_url(key)?);
        let response = self.client.execute(request).await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(StorageError::NotFound(key.to_string())),
            status => {
                return Err(StorageError::Status {
                    key: key.to_string(),
                    status: status.as_u16(),
                })
            }
        }

        Ok(ObjectStream {
            len: response.content_length(),
            body: response.bytes_stream().map_err(StorageError::from).boxed(),
        })
    }
}

impl ObjectStorage for HttpObjectStorage {
    fn open_read_stream<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<ObjectStream, StorageError>> {
        self.open(key).boxed()
    }
}
