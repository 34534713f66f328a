//! 元数据提取模块
//!
//! 对已通过候选校验的文件解析DICOM头，得到归组标识与描述字段。
//! 上游文件可能经由不同传输途径到达（本地落盘、网络推送、压缩打包），
//! 可寻址性保证各不相同，因此重试策略被表达为有序的命名策略列表，
//! 而不是嵌套的控制流。

use crate::validator::DICOM_PREAMBLE_LEN;
use flate2::read::GzDecoder;
use mia_core::utils::generate_uid;
use mia_core::{ImageMetadata, MiaError, Result};
use dicom::core::value::{PrimitiveValue, Value};
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// 一种具名的提取策略
///
/// 每个策略独立尝试以某种访问方式解析文件，返回类型化的成功或失败。
pub trait ExtractionStrategy: Send + Sync {
    /// 策略名，用于日志与失败原因归档
    fn name(&self) -> &'static str;

    /// 尝试解析并提取元数据
    fn extract(&self, path: &Path) -> Result<ImageMetadata>;
}

/// 策略一：直接按路径打开DICOM文件
pub struct DirectFileStrategy;

impl ExtractionStrategy for DirectFileStrategy {
    fn name(&self) -> &'static str {
        "direct-file"
    }

    fn extract(&self, path: &Path) -> Result<ImageMetadata> {
        let obj = open_file(path)
            .map_err(|e| MiaError::DicomParse(format!("无法解析DICOM文件: {:?}", e)))?;
        Ok(metadata_from_object(&obj))
    }
}

/// 策略二：整体读入内存后从字节缓冲解析
pub struct InMemoryStrategy;

impl ExtractionStrategy for InMemoryStrategy {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn extract(&self, path: &Path) -> Result<ImageMetadata> {
        let data = std::fs::read(path)?;
        let metadata = parse_bytes(&data);
        drop(data);
        metadata
    }
}

/// 策略三：gzip压缩变体，解压后再从字节缓冲解析
pub struct GzipStrategy;

impl ExtractionStrategy for GzipStrategy {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn extract(&self, path: &Path) -> Result<ImageMetadata> {
        let compressed = std::fs::read(path)?;
        if compressed.len() < 2 || compressed[0] != 0x1f || compressed[1] != 0x8b {
            return Err(MiaError::DicomParse("缺少gzip魔数".to_string()));
        }

        let mut data = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut data)
            .map_err(|e| MiaError::DicomParse(format!("gzip解压失败: {}", e)))?;
        drop(compressed);

        let metadata = parse_bytes(&data);
        drop(data);
        metadata
    }
}

/// 从完整文件字节（含前导区）解析DICOM对象
fn parse_bytes(data: &[u8]) -> Result<ImageMetadata> {
    if data.len() < DICOM_PREAMBLE_LEN || &data[128..DICOM_PREAMBLE_LEN] != b"DICM" {
        return Err(MiaError::DicomParse("缺少DICM魔数".to_string()));
    }

    let obj: DefaultDicomObject = dicom::object::from_reader(&data[128..])
        .map_err(|e| MiaError::DicomParse(format!("无法解析DICOM字节数据: {:?}", e)))?;
    Ok(metadata_from_object(&obj))
}

/// 一次成功提取的结果
#[derive(Debug, Clone)]
pub struct Extraction {
    /// 提取并补全后的元数据
    pub metadata: ImageMetadata,
    /// 命中的策略名
    pub strategy: &'static str,
    /// 提取过程中产生的警告（如标识符合成）
    pub warnings: Vec<String>,
}

/// 元数据提取器
///
/// 按配置顺序依次尝试各策略；任一成功即补全标识符并返回，
/// 全部失败则汇总各策略原因为一个`Unreadable`失败。
pub struct MetadataExtractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataExtractor {
    /// 创建带默认策略顺序的提取器
    pub fn new() -> Self {
        Self::with_strategies(vec![
            Box::new(DirectFileStrategy),
            Box::new(InMemoryStrategy),
            Box::new(GzipStrategy),
        ])
    }

    /// 使用自定义策略列表创建提取器
    pub fn with_strategies(strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    /// 当前策略名列表（按尝试顺序）
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// 提取一个文件的元数据
    pub fn extract(&self, path: &Path, original_name: &str) -> Result<Extraction> {
        let mut failures = Vec::new();

        for strategy in &self.strategies {
            match strategy.extract(path) {
                Ok(mut metadata) => {
                    debug!(
                        "策略 {} 解析成功: {} ({})",
                        strategy.name(),
                        original_name,
                        metadata.summary()
                    );
                    let warnings = ensure_identifiers(&mut metadata, original_name)?;
                    return Ok(Extraction {
                        metadata,
                        strategy: strategy.name(),
                        warnings,
                    });
                }
                Err(e) => {
                    debug!("策略 {} 解析失败: {}: {}", strategy.name(), original_name, e);
                    failures.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        warn!("所有提取策略均失败: {}", original_name);
        Err(MiaError::Unreadable(format!(
            "{} [{}]",
            original_name,
            failures.join("; ")
        )))
    }
}

/// 补全缺失的归组标识符
///
/// 检查/序列UID缺失时确定性地合成一个新UID并记录警告，使孤立文件
/// 仍可入库；SOP实例UID缺失则无法去重，按`missing-identifiers`失败。
fn ensure_identifiers(metadata: &mut ImageMetadata, original_name: &str) -> Result<Vec<String>> {
    let mut warnings = Vec::new();

    if metadata
        .sop_instance_uid
        .as_deref()
        .map_or(true, |uid| uid.trim().is_empty())
    {
        return Err(MiaError::MissingIdentifiers(format!(
            "缺少SOP实例UID: {}",
            original_name
        )));
    }

    if metadata
        .study_uid
        .as_deref()
        .map_or(true, |uid| uid.trim().is_empty())
    {
        let uid = generate_uid();
        warnings.push(format!(
            "{} 缺少检查实例UID，已合成 {}",
            original_name, uid
        ));
        metadata.study_uid = Some(uid);
    }

    if metadata
        .series_uid
        .as_deref()
        .map_or(true, |uid| uid.trim().is_empty())
    {
        let uid = generate_uid();
        warnings.push(format!(
            "{} 缺少序列实例UID，已合成 {}",
            original_name, uid
        ));
        metadata.series_uid = Some(uid);
    }

    if !warnings.is_empty() {
        info!("{} 标识符补全完成，{} 条警告", original_name, warnings.len());
    }
    Ok(warnings)
}

/// 从DICOM对象中提取元数据
fn metadata_from_object(obj: &DefaultDicomObject) -> ImageMetadata {
    let mut metadata = ImageMetadata::default();

    // 提取归组标识
    metadata.study_uid = get_string_element(obj, tags::STUDY_INSTANCE_UID);
    metadata.series_uid = get_string_element(obj, tags::SERIES_INSTANCE_UID);
    metadata.sop_instance_uid = get_string_element(obj, tags::SOP_INSTANCE_UID);

    // 提取患者信息
    metadata.patient_id = get_string_element(obj, tags::PATIENT_ID);
    metadata.patient_name = get_string_element(obj, tags::PATIENT_NAME);
    metadata.patient_sex = get_string_element(obj, tags::PATIENT_SEX);
    metadata.patient_birth_date = get_string_element(obj, tags::PATIENT_BIRTH_DATE);

    // 提取检查信息
    metadata.modality = get_string_element(obj, tags::MODALITY);
    metadata.study_description = get_string_element(obj, tags::STUDY_DESCRIPTION);
    metadata.study_date = get_string_element(obj, tags::STUDY_DATE);

    // 提取序列信息
    metadata.series_number = get_integer_element(obj, tags::SERIES_NUMBER);
    metadata.series_description = get_string_element(obj, tags::SERIES_DESCRIPTION);

    // 提取实例与几何/标定信息
    metadata.instance_number = get_integer_element(obj, tags::INSTANCE_NUMBER);
    metadata.rows = get_integer_element(obj, tags::ROWS);
    metadata.columns = get_integer_element(obj, tags::COLUMNS);
    metadata.pixel_spacing = get_string_element(obj, tags::PIXEL_SPACING);
    metadata.slice_thickness = get_string_element(obj, tags::SLICE_THICKNESS);

    metadata
}

/// 获取字符串类型元素的值
fn get_string_element(obj: &DefaultDicomObject, tag: dicom::core::Tag) -> Option<String> {
    match obj.element(tag) {
        Ok(element) => match element.value() {
            Value::Primitive(PrimitiveValue::Str(s)) => Some(s.trim().to_string()),
            Value::Primitive(PrimitiveValue::Strs(strings)) => {
                strings.first().map(|s| s.trim().to_string())
            }
            _ => {
                debug!("标签 {:?} 不是字符串类型", tag);
                None
            }
        },
        Err(_) => None,
    }
}

/// 获取整数类型元素的值（兼容以IS字符串编码的数值）
fn get_integer_element(obj: &DefaultDicomObject, tag: dicom::core::Tag) -> Option<i32> {
    match obj.element(tag) {
        Ok(element) => match element.value() {
            Value::Primitive(PrimitiveValue::I32(i)) => i.iter().next().copied(),
            Value::Primitive(PrimitiveValue::U32(u)) => u.iter().next().map(|&v| v as i32),
            Value::Primitive(PrimitiveValue::I16(i)) => i.iter().next().map(|&v| v as i32),
            Value::Primitive(PrimitiveValue::U16(u)) => u.iter().next().map(|&v| v as i32),
            Value::Primitive(PrimitiveValue::Str(s)) => s.trim().parse().ok(),
            Value::Primitive(PrimitiveValue::Strs(strings)) => {
                strings.first().and_then(|s| s.trim().parse().ok())
            }
            _ => None,
        },
        Err(_) => None,
    }
}
