use strata_common::protocol::error::Result;
use strata_common::protocol::{
    DeleteRequest, DeleteResponse, GetRequest, GetResponse, Message, PingRequest, PingResponse, PutRequest,
    PutResponse, ServerInfoRequest, ServerInfoResponse,
};

use crate::cluster::Cluster;

/// Strata client for issuing operations against a cluster
///
/// A thin handle: every call goes through [`Cluster::use_connection`] with
/// this handle's attempt budget. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct StrataClient {
    cluster: Cluster,
    retry_attempts: usize,
}

impl StrataClient {
    /// Create a client using the cluster's default attempt budget
    pub fn new(cluster: Cluster) -> Self {
        let retry_attempts = cluster.retry_config().max_attempts;
        Self {
            cluster,
            retry_attempts,
        }
    }

    /// Copy of this client with a different attempt budget
    pub fn with_retry_attempts(&self, attempts: usize) -> Self {
        Self {
            cluster: self.cluster.clone(),
            retry_attempts: attempts,
        }
    }

    pub fn retry_attempts(&self) -> usize {
        self.retry_attempts
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub async fn ping(&self) -> Result<()> {
        self.send::<_, PingResponse>(PingRequest).await?;
        Ok(())
    }

    pub async fn server_info(&self) -> Result<ServerInfoResponse> {
        self.send(ServerInfoRequest).await
    }

    /// Fetch a value; `None` when the key does not exist
    pub async fn get(&self, bucket: impl Into<String>, key: impl Into<Vec<u8>>) -> Result<Option<Vec<u8>>> {
        let request = GetRequest {
            bucket: bucket.into(),
            key: key.into(),
        };
        let response: GetResponse = self.send(request).await?;
        Ok(response.value)
    }

    pub async fn put(
        &self,
        bucket: impl Into<String>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let request = PutRequest {
            bucket: bucket.into(),
            key: key.into(),
            value: value.into(),
        };
        self.send::<_, PutResponse>(request).await?;
        Ok(())
    }

    pub async fn delete(&self, bucket: impl Into<String>, key: impl Into<Vec<u8>>) -> Result<()> {
        let request = DeleteRequest {
            bucket: bucket.into(),
            key: key.into(),
        };
        self.send::<_, DeleteResponse>(request).await?;
        Ok(())
    }

    /// Send any registered request type and decode the registered response
    pub async fn send<Req, Resp>(&self, request: Req) -> Result<Resp>
    where
        Req: Message,
        Resp: Message,
    {
        self.cluster
            .execute_command_with_attempts(request, self.retry_attempts)
            .await
    }
}
