//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 检查信息（一次临床检查，含患者身份字段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub id: Uuid,
    pub study_uid: String, // DICOM Study Instance UID
    pub patient_id: Option<String>,   // 医院内部患者ID
    pub patient_name: Option<String>, // 患者姓名
    pub patient_sex: Option<String>,  // 性别 (M/F/O)
    pub patient_birth_date: Option<String>,
    pub modality: String, // 检查设备类型 (CT, MR, DR等)
    pub description: Option<String>,
    pub study_date: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 序列信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub id: Uuid,
    pub series_uid: String, // DICOM Series Instance UID
    pub study_id: Uuid,
    pub modality: String,
    pub series_number: Option<i32>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 影像实例信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInstance {
    pub id: Uuid,
    pub sop_instance_uid: String, // DICOM SOP Instance UID
    pub series_id: Uuid,
    pub instance_number: Option<i32>,
    pub rows: Option<i32>,
    pub columns: Option<i32>,
    pub pixel_spacing: Option<String>,
    pub slice_thickness: Option<String>,
    pub storage_path: String,
    pub file_size: i64,
    pub content_digest: String,
    pub created_at: DateTime<Utc>,
}

/// 单个文件的提取元数据，驱动Study→Series→Image的归组
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// 检查实例UID
    pub study_uid: Option<String>,
    /// 序列实例UID
    pub series_uid: Option<String>,
    /// SOP实例UID
    pub sop_instance_uid: Option<String>,

    /// 患者ID
    pub patient_id: Option<String>,
    /// 患者姓名
    pub patient_name: Option<String>,
    /// 患者性别
    pub patient_sex: Option<String>,
    /// 患者出生日期
    pub patient_birth_date: Option<String>,

    /// 模态
    pub modality: Option<String>,
    /// 检查描述
    pub study_description: Option<String>,
    /// 检查日期
    pub study_date: Option<String>,

    /// 序列号
    pub series_number: Option<i32>,
    /// 序列描述
    pub series_description: Option<String>,

    /// 实例号
    pub instance_number: Option<i32>,
    /// 图像行数
    pub rows: Option<i32>,
    /// 图像列数
    pub columns: Option<i32>,
    /// 像素间距
    pub pixel_spacing: Option<String>,
    /// 层厚
    pub slice_thickness: Option<String>,
}

impl ImageMetadata {
    /// 获取DICOM对象的摘要信息
    pub fn summary(&self) -> String {
        format!(
            "患者ID={}, 检查UID={}, 序列UID={}, 模态={}",
            self.patient_id.as_deref().unwrap_or("未知"),
            self.study_uid.as_deref().unwrap_or("未知"),
            self.series_uid.as_deref().unwrap_or("未知"),
            self.modality.as_deref().unwrap_or("未知")
        )
    }
}

/// 持久化单个文件后的归属结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistOutcome {
    pub study_id: Uuid,
    pub series_id: Uuid,
    pub instance_id: Uuid,
    pub study_uid: String,
    /// 本次持久化是否新建了检查行
    pub study_created: bool,
    /// 本次持久化是否新建了序列行
    pub series_created: bool,
    /// 本次持久化是否新建了实例行（false表示附着到已有实例）
    pub instance_created: bool,
}

/// 已落盘的文件载荷位置
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub storage_path: String,
    pub file_size: i64,
    pub content_digest: String,
}
