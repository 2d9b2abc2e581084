//! Presigned chunk writes and download streams

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::{
    CHUNK_LOCATION, CHUNK_UPLOAD, DOWNLOAD_STREAM, Envelope, PlatformClient, classify_rejection,
    read_json,
};
use crate::config::Zone;
use crate::error::{Error, Result};
use crate::services::{ChunkLocationRequest, ReadStream, StorageGateway};
use crate::utils::filename_from_content_disposition;

#[async_trait]
impl StorageGateway for PlatformClient {
    async fn chunk_write_location(&self, request: &ChunkLocationRequest) -> Result<String> {
        let url = format!(
            "{}/v1/files/chunks/presigned",
            self.endpoints.upload_url(request.zone)
        );
        let chunk_number = request.chunk_index.to_string();
        let response = self
            .authorize(self.http.get(&url), false)
            .await?
            .query(&[
                ("bucket", request.bucket.as_str()),
                ("key", request.key.as_str()),
                ("upload_id", request.transfer_id.as_str()),
                ("chunk_number", chunk_number.as_str()),
            ])
            .send()
            .await?;
        let location: Envelope<String> = read_json(CHUNK_LOCATION, response).await?;
        Ok(location.result)
    }

    async fn put_chunk(&self, location: &str, data: Bytes) -> Result<()> {
        let response = self.http.put(location).body(data).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                operation: CHUNK_UPLOAD,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    fn download_location(&self, zone: Zone, hash_code: &str) -> String {
        format!("{}v1/download/{}", self.endpoints.download_url(zone), hash_code)
    }

    async fn open_read(&self, location: &str) -> Result<ReadStream> {
        let response = self.http.get(location).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_rejection(DOWNLOAD_STREAM, status.as_u16(), body));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header("content-type");
        let file_name = header("content-disposition")
            .as_deref()
            .and_then(filename_from_content_disposition);
        let total_size = response.content_length().filter(|len| *len > 0);

        let body = futures::stream::unfold(Some(response), |state| async move {
            let mut response = state?;
            match response.chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes.to_vec()), Some(response))),
                Ok(None) => None,
                Err(e) => Some((Err(Error::from(e)), None)),
            }
        })
        .boxed();

        Ok(ReadStream {
            total_size,
            content_type,
            file_name,
            body,
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::super::tests::client_for;
    use super::*;
    use futures::TryStreamExt;
    use wiremock::matchers::{body_bytes, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn presigned_location_uses_zone_upload_service() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/upload/gr/v1/files/chunks/presigned"))
            .and(query_param("bucket", "gr-proj"))
            .and(query_param("key", "alice/a b.bin"))
            .and(query_param("upload_id", "rid-1"))
            .and(query_param("chunk_number", "3"))
            .and(header("Session-ID", "sid-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": format!("{}/minio/part-3", server.uri())
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = ChunkLocationRequest {
            zone: Zone::Greenroom,
            bucket: "gr-proj".to_string(),
            key: "alice/a b.bin".to_string(),
            transfer_id: "rid-1".to_string(),
            chunk_index: 3,
        };
        let location = client_for(&server.uri())
            .chunk_write_location(&request)
            .await
            .unwrap();
        assert!(location.ends_with("/minio/part-3"));
    }

    #[tokio::test]
    async fn put_chunk_sends_bytes_and_reports_failures() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/minio/ok"))
            .and(body_bytes(b"chunk-bytes".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/minio/fail"))
            .respond_with(ResponseTemplate::new(503).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        client
            .put_chunk(
                &format!("{}/minio/ok", server.uri()),
                Bytes::from_static(b"chunk-bytes"),
            )
            .await
            .unwrap();

        let err = client
            .put_chunk(&format!("{}/minio/fail", server.uri()), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Http { operation: CHUNK_UPLOAD, status: 503, ref body } if body == "slow down"
        ));
    }

    #[tokio::test]
    async fn open_read_exposes_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/portal/download/gr/v1/download/h1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/zip")
                    .insert_header("content-disposition", r#"attachment; filename="data.zip""#)
                    .set_body_bytes(vec![1u8; 1000]),
            )
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let location = client.download_location(Zone::Greenroom, "h1");
        let stream = client.open_read(&location).await.unwrap();
        assert_eq!(stream.total_size, Some(1000));
        assert_eq!(stream.content_type.as_deref(), Some("application/zip"));
        assert_eq!(stream.file_name.as_deref(), Some("data.zip"));

        let chunks: Vec<Vec<u8>> = stream.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), vec![1u8; 1000]);
    }
}
