//! PostgreSQL持久层实现
//!
//! 每个文件一个事务；Study/Series/Image均以
//! `INSERT .. ON CONFLICT .. RETURNING`做get-or-create，
//! 并发创建同一检查时由唯一约束保证只落一行。

use crate::models::DbStudy;
use crate::repository::ImageRepository;
use async_trait::async_trait;
use mia_core::{ImageMetadata, MiaError, PersistOutcome, Result, StoredBlob, Study};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

/// PostgreSQL影像仓库
pub struct PgImageRepository {
    pool: PgPool,
}

impl PgImageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS studies (
                id UUID PRIMARY KEY,
                study_uid VARCHAR(64) UNIQUE NOT NULL,
                patient_id VARCHAR(64),
                patient_name VARCHAR(255),
                patient_sex CHAR(1),
                patient_birth_date VARCHAR(16),
                modality VARCHAR(16) NOT NULL,
                description TEXT,
                study_date VARCHAR(16),
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#).execute(&self.pool).await.map_err(map_db_error)?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS series (
                id UUID PRIMARY KEY,
                series_uid VARCHAR(64) NOT NULL,
                study_id UUID NOT NULL REFERENCES studies(id),
                modality VARCHAR(16) NOT NULL,
                series_number INTEGER,
                description TEXT,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                UNIQUE (study_id, series_uid)
            )
        "#).execute(&self.pool).await.map_err(map_db_error)?;

        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS instances (
                id UUID PRIMARY KEY,
                sop_instance_uid VARCHAR(64) NOT NULL,
                series_id UUID NOT NULL REFERENCES series(id),
                instance_number INTEGER,
                rows INTEGER,
                columns INTEGER,
                pixel_spacing VARCHAR(64),
                slice_thickness VARCHAR(32),
                storage_path VARCHAR(512) NOT NULL,
                file_size BIGINT NOT NULL,
                content_digest VARCHAR(64) NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                UNIQUE (series_id, sop_instance_uid)
            )
        "#).execute(&self.pool).await.map_err(map_db_error)?;

        // 创建索引以优化查询性能
        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_studies_study_uid ON studies(study_uid)",
            "CREATE INDEX IF NOT EXISTS idx_studies_patient_id ON studies(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_studies_modality ON studies(modality)",
            "CREATE INDEX IF NOT EXISTS idx_series_study_id ON series(study_id)",
            "CREATE INDEX IF NOT EXISTS idx_instances_series_id ON instances(series_id)",
            "CREATE INDEX IF NOT EXISTS idx_instances_sop_instance_uid ON instances(sop_instance_uid)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql)
                .execute(&self.pool)
                .await
                .map_err(map_db_error)?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }

    /// 检查级get-or-create
    async fn upsert_study(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        metadata: &ImageMetadata,
        study_uid: &str,
    ) -> Result<(Uuid, bool)> {
        // xmax = 0 仅在行由本语句插入时成立，用于区分新建与命中已有行
        let row = sqlx::query(r#"
            INSERT INTO studies (id, study_uid, patient_id, patient_name, patient_sex, patient_birth_date, modality, description, study_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (study_uid) DO UPDATE SET updated_at = NOW()
            RETURNING id, (xmax = 0) AS created
        "#)
        .bind(Uuid::new_v4())
        .bind(study_uid)
        .bind(&metadata.patient_id)
        .bind(&metadata.patient_name)
        .bind(&metadata.patient_sex)
        .bind(&metadata.patient_birth_date)
        .bind(metadata.modality.as_deref().unwrap_or("OT"))
        .bind(&metadata.study_description)
        .bind(&metadata.study_date)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_db_error)?;

        Ok((row.get("id"), row.get("created")))
    }

    /// 序列级get-or-create（序列UID在所属检查内唯一）
    async fn upsert_series(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        metadata: &ImageMetadata,
        study_id: Uuid,
        series_uid: &str,
    ) -> Result<(Uuid, bool)> {
        let row = sqlx::query(r#"
            INSERT INTO series (id, series_uid, study_id, modality, series_number, description)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (study_id, series_uid) DO UPDATE SET modality = EXCLUDED.modality
            RETURNING id, (xmax = 0) AS created
        "#)
        .bind(Uuid::new_v4())
        .bind(series_uid)
        .bind(study_id)
        .bind(metadata.modality.as_deref().unwrap_or("OT"))
        .bind(metadata.series_number)
        .bind(&metadata.series_description)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_db_error)?;

        Ok((row.get("id"), row.get("created")))
    }

    /// 实例级get-or-create（重复实例更新载荷位置而非另起一行）
    async fn upsert_instance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        metadata: &ImageMetadata,
        blob: &StoredBlob,
        series_id: Uuid,
        sop_instance_uid: &str,
    ) -> Result<(Uuid, bool)> {
        let row = sqlx::query(r#"
            INSERT INTO instances (id, sop_instance_uid, series_id, instance_number, rows, columns, pixel_spacing, slice_thickness, storage_path, file_size, content_digest)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (series_id, sop_instance_uid) DO UPDATE
                SET storage_path = EXCLUDED.storage_path,
                    file_size = EXCLUDED.file_size,
                    content_digest = EXCLUDED.content_digest
            RETURNING id, (xmax = 0) AS created
        "#)
        .bind(Uuid::new_v4())
        .bind(sop_instance_uid)
        .bind(series_id)
        .bind(metadata.instance_number)
        .bind(metadata.rows)
        .bind(metadata.columns)
        .bind(&metadata.pixel_spacing)
        .bind(&metadata.slice_thickness)
        .bind(&blob.storage_path)
        .bind(blob.file_size)
        .bind(&blob.content_digest)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_db_error)?;

        Ok((row.get("id"), row.get("created")))
    }
}

#[async_trait]
impl ImageRepository for PgImageRepository {
    async fn persist_instance(
        &self,
        metadata: &ImageMetadata,
        blob: &StoredBlob,
    ) -> Result<PersistOutcome> {
        let study_uid = required_uid(&metadata.study_uid, "检查UID")?;
        let series_uid = required_uid(&metadata.series_uid, "序列UID")?;
        let sop_instance_uid = required_uid(&metadata.sop_instance_uid, "SOP实例UID")?;

        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        let (study_id, study_created) = self.upsert_study(&mut tx, metadata, &study_uid).await?;
        let (series_id, series_created) = self
            .upsert_series(&mut tx, metadata, study_id, &series_uid)
            .await?;
        let (instance_id, instance_created) = self
            .upsert_instance(&mut tx, metadata, blob, series_id, &sop_instance_uid)
            .await?;

        tx.commit().await.map_err(map_db_error)?;

        debug!(
            "实例已持久化: {} (检查新建: {}, 序列新建: {}, 实例新建: {})",
            sop_instance_uid, study_created, series_created, instance_created
        );

        Ok(PersistOutcome {
            study_id,
            series_id,
            instance_id,
            study_uid,
            study_created,
            series_created,
            instance_created,
        })
    }

    async fn get_study_by_uid(&self, study_uid: &str) -> Result<Option<Study>> {
        let result = sqlx::query_as::<_, DbStudy>("SELECT * FROM studies WHERE study_uid = $1")
            .bind(study_uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;

        Ok(result.map(Study::from))
    }

    async fn study_count(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM studies")
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;
        let count: i64 = row.get("count");
        Ok(count as usize)
    }
}

fn required_uid(uid: &Option<String>, name: &str) -> Result<String> {
    uid.as_deref()
        .filter(|u| !u.trim().is_empty())
        .map(|u| u.to_string())
        .ok_or_else(|| MiaError::MissingIdentifiers(format!("缺少{}", name)))
}

/// 将sqlx错误映射为类型化错误
///
/// 唯一冲突(23505)和引用/检查违例(23503/23514)属文件级，
/// 连接层故障属会话级`Database`错误。
fn map_db_error(e: sqlx::Error) -> MiaError {
    if let sqlx::Error::Database(db_err) = &e {
        match db_err.code().as_deref() {
            Some("23505") => return MiaError::DuplicateConflict(db_err.to_string()),
            Some("23503") | Some("23514") => return MiaError::Integrity(db_err.to_string()),
            _ => {}
        }
    }
    MiaError::Database(e.to_string())
}
