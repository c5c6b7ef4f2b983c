use std::fmt::Debug;

use redis::{
    aio::MultiplexedConnection, cluster::ClusterClientBuilder, cluster_async::ClusterConnection,
    AsyncCommands, Client, FromRedisValue, Pipeline, RedisResult,
};

/// Configuration for a Redis connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The nodes to use to connect to the Redis cluster or instance.
    pub nodes: Vec<String>,
    /// The password to use to connect to the Redis cluster or instance.
    pub password: Option<String>,
    /// Whether to use cluster mode for the Redis connection.
    pub cluster_mode: bool,
}

/// A wrapper around a Redis connection that can be used to
/// get a connection to a Redis cluster or instance.
/// This provides a unified interface for both single node and cluster mode
/// connections for the subset of Redis commands used by the delivery pipeline.
pub enum ConnectionWrapper {
    Cluster(ClusterConnection),
    SingleNode(MultiplexedConnection),
}

impl Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionWrapper::Cluster(_) => {
                write!(f, "ConnectionWrapper::Cluster")
            }
            ConnectionWrapper::SingleNode(_) => write!(f, "ConnectionWrapper::SingleNode"),
        }
    }
}

impl Clone for ConnectionWrapper {
    fn clone(&self) -> Self {
        match self {
            ConnectionWrapper::Cluster(conn) => ConnectionWrapper::Cluster(conn.clone()),
            ConnectionWrapper::SingleNode(conn) => ConnectionWrapper::SingleNode(conn.clone()),
        }
    }
}

impl ConnectionWrapper {
    /// Get the value of a key, `None` when the key does not exist.
    /// [Redis Docs](https://redis.io/commands/GET)
    pub async fn get(&mut self, key: &str) -> RedisResult<Option<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.get(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.get(key).await,
        }
    }

    /// Set the value of a key without an expiration.
    /// [Redis Docs](https://redis.io/commands/SET)
    pub async fn set(&mut self, key: &str, value: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.set(key, value).await,
            ConnectionWrapper::SingleNode(conn) => conn.set(key, value).await,
        }
    }

    /// Set the value and expiration of a key, in milliseconds.
    /// [Redis Docs](https://redis.io/commands/SET)
    pub async fn pset_ex(&mut self, key: &str, value: &str, expire_ms: u64) -> RedisResult<bool> {
        let result: Option<String> = match self {
            ConnectionWrapper::Cluster(conn) => conn.pset_ex(key, value, expire_ms).await?,
            ConnectionWrapper::SingleNode(conn) => conn.pset_ex(key, value, expire_ms).await?,
        };

        Ok(result.is_some())
    }

    /// Set the value and expiration of a key, in milliseconds, only if the key does not exist.
    /// [Redis Docs](https://redis.io/commands/SET).
    /// This maps to the `SET` command with the `NX` and `PX` options.
    ///
    /// Returns `true` if the key was set, `false` if the key already existed.
    pub async fn pset_ex_nx(
        &mut self,
        key: &str,
        value: &str,
        expire_ms: u64,
    ) -> RedisResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX") // Only set if key doesn't exist
            .arg("PX") // Expire in milliseconds
            .arg(expire_ms);

        let result: Option<String> = match self {
            ConnectionWrapper::Cluster(conn) => cmd.query_async(conn).await?,
            ConnectionWrapper::SingleNode(conn) => cmd.query_async(conn).await?,
        };

        Ok(result.is_some())
    }

    /// Removes the specified key, returning whether the key existed.
    /// [Redis Docs](https://redis.io/commands/DEL)
    pub async fn del(&mut self, key: &str) -> RedisResult<bool> {
        let removed: i64 = match self {
            ConnectionWrapper::Cluster(conn) => conn.del(key).await?,
            ConnectionWrapper::SingleNode(conn) => conn.del(key).await?,
        };

        Ok(removed > 0)
    }

    /// Increments the integer value of a key by one, returning the new value.
    /// [Redis Docs](https://redis.io/commands/INCR)
    pub async fn incr(&mut self, key: &str) -> RedisResult<i64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.incr(key, 1).await,
            ConnectionWrapper::SingleNode(conn) => conn.incr(key, 1).await,
        }
    }

    /// Sets a time to live on a key, in milliseconds.
    /// [Redis Docs](https://redis.io/commands/PEXPIRE)
    pub async fn pexpire(&mut self, key: &str, expire_ms: i64) -> RedisResult<bool> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.pexpire(key, expire_ms).await,
            ConnectionWrapper::SingleNode(conn) => conn.pexpire(key, expire_ms).await,
        }
    }

    /// Evaluates a Lua script.
    /// [Redis Docs](https://redis.io/commands/EVAL)
    pub async fn eval_script<T: Default + FromRedisValue>(
        &mut self,
        script: &str,
        keys: &[&str],
        args: &[&str],
    ) -> RedisResult<T> {
        if keys.is_empty() {
            return Ok(T::default());
        }

        let script_obj = redis::Script::new(script);
        let mut script_invocation = &mut script_obj.key(keys[0]);
        for key in keys.iter().skip(1) {
            script_invocation = script_invocation.key(key);
        }

        for arg in args {
            script_invocation = script_invocation.arg(arg);
        }

        let expected: T = match self {
            ConnectionWrapper::Cluster(conn) => script_invocation.invoke_async(conn).await?,
            ConnectionWrapper::SingleNode(conn) => script_invocation.invoke_async(conn).await?,
        };

        Ok(expected)
    }

    /// Executes a pipeline of commands asynchronously.
    /// [Redis Docs](https://redis.io/docs/latest/reference/pipelining/)
    pub async fn query_pipeline_async(
        &mut self,
        pipeline: &mut Pipeline,
    ) -> RedisResult<Vec<Option<String>>> {
        match self {
            ConnectionWrapper::Cluster(conn) => pipeline.query_async(conn).await,
            ConnectionWrapper::SingleNode(conn) => pipeline.query_async(conn).await,
        }
    }
}

/// Creates a connection to a Redis cluster or instance.
pub async fn get_redis_connection(conn_config: &ConnectionConfig) -> RedisResult<ConnectionWrapper> {
    if !conn_config.cluster_mode {
        let client = Client::open(conn_config.nodes[0].clone())?;
        return Ok(ConnectionWrapper::SingleNode(
            client.get_multiplexed_async_connection().await?,
        ));
    }

    let mut builder = ClusterClientBuilder::new(conn_config.nodes.clone());
    if let Some(password) = conn_config.password.clone() {
        builder = builder.password(password);
    }
    let client = builder.build()?;

    Ok(ConnectionWrapper::Cluster(
        client.get_async_connection().await?,
    ))
}
