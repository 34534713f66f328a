//! 通用工具函数

use uuid::Uuid;

/// 生成唯一的DICOM标识符
///
/// 采用UUID派生UID形式（2.25.<uuid的十进制表示>），每次调用保证唯一。
pub fn generate_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// 验证DICOM UID格式
pub fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uid() {
        let uid = generate_uid();
        assert!(is_valid_uid(&uid));
        assert!(uid.starts_with("2.25."));
        // 两次生成不重复
        assert_ne!(uid, generate_uid());
    }

    #[test]
    fn test_is_valid_uid() {
        assert!(is_valid_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_uid(""));
        assert!(!is_valid_uid(".1.2.3"));
        assert!(!is_valid_uid("1.2.3."));
        assert!(!is_valid_uid("1..2.3"));
        assert!(!is_valid_uid("invalid.uid.with.letters"));
    }
}
