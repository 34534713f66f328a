//! 测试样例合成
//!
//! 在测试中按需合成最小可解析的DICOM文件，避免在仓库中携带
//! 真实影像数据。

use flate2::write::GzEncoder;
use flate2::Compression;
use mia_core::{MiaError, Result};
use dicom::core::value::PrimitiveValue;
use dicom::core::{DataElement, VR};
use dicom::dictionary_std::tags;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use std::io::Write;
use std::path::Path;

/// Secondary Capture Image Storage
const SC_SOP_CLASS_UID: &str = "1.2.840.10008.5.1.4.1.1.7";
/// Explicit VR Little Endian
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// 待合成实例的描述
#[derive(Debug, Clone, Default)]
pub struct FixtureInstance {
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    pub sop_instance_uid: String,
    pub modality: String,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub series_number: Option<i32>,
}

/// 合成一个DICOM实例并写入文件（含128字节前导区与DICM魔数）
pub fn write_instance(path: &Path, fixture: &FixtureInstance) -> Result<()> {
    std::fs::write(path, build_instance_bytes(fixture)?)?;
    Ok(())
}

/// 合成一个gzip压缩的DICOM实例
pub fn write_gzipped_instance(path: &Path, fixture: &FixtureInstance) -> Result<()> {
    let raw = build_instance_bytes(fixture)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&raw)?;
    let compressed = encoder
        .finish()
        .map_err(|e| MiaError::Internal(format!("gzip压缩失败: {}", e)))?;
    std::fs::write(path, compressed)?;
    Ok(())
}

/// 合成DICOM实例的完整文件字节
pub fn build_instance_bytes(fixture: &FixtureInstance) -> Result<Vec<u8>> {
    let mut obj = InMemDicomObject::new_empty();

    put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, SC_SOP_CLASS_UID);
    put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, &fixture.sop_instance_uid);
    put_str(&mut obj, tags::MODALITY, VR::CS, &fixture.modality);

    if let Some(uid) = &fixture.study_uid {
        put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, uid);
    }
    if let Some(uid) = &fixture.series_uid {
        put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, uid);
    }
    if let Some(id) = &fixture.patient_id {
        put_str(&mut obj, tags::PATIENT_ID, VR::LO, id);
    }
    if let Some(name) = &fixture.patient_name {
        put_str(&mut obj, tags::PATIENT_NAME, VR::PN, name);
    }
    if let Some(number) = fixture.series_number {
        put_str(&mut obj, tags::SERIES_NUMBER, VR::IS, &number.to_string());
    }

    let file_obj = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(SC_SOP_CLASS_UID)
                .media_storage_sop_instance_uid(&fixture.sop_instance_uid)
                .transfer_syntax(EXPLICIT_VR_LE),
        )
        .map_err(|e| MiaError::Internal(format!("构建文件元信息失败: {:?}", e)))?;

    let mut bytes = Vec::new();
    file_obj
        .write_all(&mut bytes)
        .map_err(|e| MiaError::Internal(format!("序列化DICOM对象失败: {:?}", e)))?;
    Ok(bytes)
}

fn put_str(obj: &mut InMemDicomObject, tag: dicom::core::Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}
