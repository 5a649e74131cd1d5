//! Redis 缓存管理模块
//!
//! 提供 Redis 连接管理和有界列表操作封装。
//! 推送与裁剪在同一个原子 pipeline 中执行，列表长度严格不超过容量上限。

use crate::config::RedisConfig;
use crate::error::{RelayError, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{info, instrument};

/// Redis 缓存客户端
#[derive(Clone)]
pub struct Cache {
    client: Client,
}

impl Cache {
    /// 创建 Redis 客户端
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self { client })
    }

    /// 获取连接
    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(RelayError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(RelayError::from)
    }

    /// 向有界列表尾部追加一条记录
    ///
    /// RPUSH 和 LTRIM 打包为单个原子 pipeline：列表超过容量时
    /// 只保留最新的 `capacity` 条（最旧的头部元素被裁掉），
    /// 并发追加也不会观察到超出容量的瞬时状态。
    #[instrument(skip(self, value))]
    pub async fn push_capped<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        capacity: usize,
    ) -> Result<()> {
        let serialized = serde_json::to_string(value)
            .map_err(|e| RelayError::Internal(format!("Cache serialization error: {}", e)))?;

        let mut conn = self.get_conn().await?;
        let start = -(capacity as isize);
        redis::pipe()
            .atomic()
            .rpush(key, serialized)
            .ignore()
            .ltrim(key, start, -1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    /// 列表当前长度
    pub async fn list_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    /// 按插入顺序取回整个列表
    #[instrument(skip(self))]
    pub async fn list_all<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        let mut conn = self.get_conn().await?;
        let raw: Vec<String> = conn.lrange(key, 0, -1).await?;

        raw.iter()
            .map(|item| {
                serde_json::from_str(item).map_err(|e| {
                    RelayError::Internal(format!("Cache deserialization error: {}", e))
                })
            })
            .collect()
    }

    /// 删除键
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
