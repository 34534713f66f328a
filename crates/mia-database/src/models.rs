//! 数据库行模型

use chrono::{DateTime, Utc};
use mia_core::Study;
use uuid::Uuid;

/// 检查表行
#[derive(Debug, sqlx::FromRow)]
pub struct DbStudy {
    pub id: Uuid,
    pub study_uid: String,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_sex: Option<String>,
    pub patient_birth_date: Option<String>,
    pub modality: String,
    pub description: Option<String>,
    pub study_date: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbStudy> for Study {
    fn from(row: DbStudy) -> Self {
        Study {
            id: row.id,
            study_uid: row.study_uid,
            patient_id: row.patient_id,
            patient_name: row.patient_name,
            patient_sex: row.patient_sex,
            patient_birth_date: row.patient_birth_date,
            modality: row.modality,
            description: row.description,
            study_date: row.study_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

