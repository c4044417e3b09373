//! 主键的原生字符串形式。
//!
//! # 教案式说明
//! - **意图 (Why)**：未携带备用键选择器的请求使用原生形式寻址；响应在未启用备用键时也以原生形式书写键位。
//! - **格式 (What)**：
//!   - 单值键：标量文本，例如 `1`、`Alt%201`；
//!   - 复合键：`(a:1,b:x)`，段按名称排序；
//!   - 复杂键：键记录字段后接 `$params:(...)`，例如 `(major:KEY%201,minor:KEY%202)`；
//!   - 值内的保留字符（`%` `(` `)` `,` `:` `'`、URI 通用分隔符 `/` `?` `#` `[` `]` `@`、
//!     `&` `=` `+` 与空白）一律百分号转义，编码结果可直接作为单个路径段；
//!   - 空字符串写作 `''`，字面量 `'` 总是被转义，因此不会与之混淆。
//! - **契约 (What)**：对任意满足形状的键 `k`，`decode(shape, &encode(&k)) == Ok(k)`。

use std::fmt::Write as _;

use thiserror::Error;

use super::{KeyShape, PrimaryKey, Record, RecordSchema, Scalar, ScalarType};
use crate::key::{ComplexKey, CompoundKey};

/// 复杂键中参数记录的保留字段名。
pub const PARAMS_FIELD: &str = "$params";

/// 空字符串值的原生写法。
pub const EMPTY_STRING: &str = "''";

/// 原生键字符串解码失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KeyDecodeError {
    #[error("key is empty")]
    Empty,
    #[error("invalid percent-escape in `{raw}`")]
    InvalidEscape { raw: String },
    #[error("`{raw}` is not a parenthesized key record")]
    NotARecord { raw: String },
    #[error("malformed key entry `{entry}`")]
    MalformedEntry { entry: String },
    #[error("value `{value}` is not a valid {ty}")]
    InvalidScalar { ty: ScalarType, value: String },
    #[error("key part `{name}` is missing")]
    MissingPart { name: String },
    #[error("key part `{name}` is not declared")]
    UnknownPart { name: String },
    #[error("key part `{name}` appears more than once")]
    DuplicatePart { name: String },
}

/// 将主键编码为原生字符串。
pub fn encode(key: &PrimaryKey) -> String {
    match key {
        PrimaryKey::Simple(scalar) => encode_value(scalar),
        PrimaryKey::Compound(key) => {
            let mut out = String::from("(");
            write_entries(&mut out, key.parts());
            out.push(')');
            out
        }
        PrimaryKey::Complex(key) => {
            let mut out = String::from("(");
            write_entries(
                &mut out,
                key.key.iter().map(|(name, value)| (name.as_str(), value)),
            );
            if let Some(params) = &key.params {
                if !key.key.is_empty() {
                    out.push(',');
                }
                out.push_str(PARAMS_FIELD);
                out.push_str(":(");
                write_entries(
                    &mut out,
                    params.iter().map(|(name, value)| (name.as_str(), value)),
                );
                out.push(')');
            }
            out.push(')');
            out
        }
    }
}

fn write_entries<'a>(out: &mut String, entries: impl Iterator<Item = (&'a str, &'a Scalar)>) {
    for (index, (name, value)) in entries.enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&escape(name));
        out.push(':');
        out.push_str(&encode_value(value));
    }
}

fn encode_value(value: &Scalar) -> String {
    match value {
        Scalar::String(text) if text.is_empty() => EMPTY_STRING.to_owned(),
        other => escape(&other.to_string()),
    }
}

fn decode_value(raw: &str) -> Result<String, KeyDecodeError> {
    if raw == EMPTY_STRING {
        Ok(String::new())
    } else {
        unescape(raw)
    }
}

/// 按资源声明的形状解码原生键字符串。
///
/// # 教案式说明
/// - **执行 (How)**：单值键直接反转义后按标量类型解析；复合/复杂键先切分顶层 `name:value` 条目，
///   再逐段按声明类型解析，`$params` 条目递归解析为参数记录；
/// - **契约 (What)**：未声明的段、重复段、缺失的必填段都会被拒绝，错误统一归类为客户端错误。
pub fn decode(shape: &KeyShape, raw: &str) -> Result<PrimaryKey, KeyDecodeError> {
    if raw.is_empty() {
        return Err(KeyDecodeError::Empty);
    }
    match shape {
        KeyShape::Simple { ty } => {
            let text = decode_value(raw)?;
            parse_scalar(*ty, &text).map(PrimaryKey::Simple)
        }
        KeyShape::Compound { parts } => {
            let mut key = CompoundKey::new();
            for (name, value) in split_record(raw)? {
                let part = parts
                    .iter()
                    .find(|part| part.name == name)
                    .ok_or_else(|| KeyDecodeError::UnknownPart { name: name.clone() })?;
                let scalar = parse_scalar(part.ty, &decode_value(value)?)?;
                if key.insert(name.clone(), scalar).is_some() {
                    return Err(KeyDecodeError::DuplicatePart { name });
                }
            }
            if let Some(missing) = parts.iter().find(|part| key.part(&part.name).is_none()) {
                return Err(KeyDecodeError::MissingPart {
                    name: missing.name.clone(),
                });
            }
            Ok(PrimaryKey::Compound(key))
        }
        KeyShape::Complex {
            key: key_schema,
            params: params_schema,
        } => {
            let mut key = ComplexKey::default();
            for (name, value) in split_record(raw)? {
                if name == PARAMS_FIELD {
                    let schema =
                        params_schema
                            .as_ref()
                            .ok_or_else(|| KeyDecodeError::UnknownPart {
                                name: name.clone(),
                            })?;
                    if key.params.is_some() {
                        return Err(KeyDecodeError::DuplicatePart { name });
                    }
                    key.params = Some(decode_record(schema, value)?);
                    continue;
                }
                insert_field(&mut key.key, key_schema, name, value)?;
            }
            require_fields(&key.key, key_schema)?;
            Ok(PrimaryKey::Complex(key))
        }
    }
}

fn decode_record(schema: &RecordSchema, raw: &str) -> Result<Record, KeyDecodeError> {
    let mut record = Record::new();
    for (name, value) in split_record(raw)? {
        insert_field(&mut record, schema, name, value)?;
    }
    require_fields(&record, schema)?;
    Ok(record)
}

fn insert_field(
    record: &mut Record,
    schema: &RecordSchema,
    name: String,
    value: &str,
) -> Result<(), KeyDecodeError> {
    let field = schema
        .field(&name)
        .ok_or_else(|| KeyDecodeError::UnknownPart { name: name.clone() })?;
    let scalar = parse_scalar(field.ty, &decode_value(value)?)?;
    if record.insert(name.clone(), scalar).is_some() {
        return Err(KeyDecodeError::DuplicatePart { name });
    }
    Ok(())
}

fn require_fields(record: &Record, schema: &RecordSchema) -> Result<(), KeyDecodeError> {
    match schema
        .fields
        .iter()
        .find(|field| !field.optional && !record.contains_key(&field.name))
    {
        Some(field) => Err(KeyDecodeError::MissingPart {
            name: field.name.clone(),
        }),
        None => Ok(()),
    }
}

fn parse_scalar(ty: ScalarType, text: &str) -> Result<Scalar, KeyDecodeError> {
    Scalar::parse(ty, text).ok_or_else(|| KeyDecodeError::InvalidScalar {
        ty,
        value: text.to_owned(),
    })
}

/// 切分 `(name:value,...)` 的顶层条目；名称已反转义，值保持原样交由调用方按类型处理。
fn split_record(raw: &str) -> Result<Vec<(String, &str)>, KeyDecodeError> {
    let inner = raw
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| KeyDecodeError::NotARecord {
            raw: raw.to_owned(),
        })?;

    let mut entries = Vec::new();
    if inner.is_empty() {
        return Ok(entries);
    }

    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, ch) in inner.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| KeyDecodeError::NotARecord {
                    raw: raw.to_owned(),
                })?;
            }
            ',' if depth == 0 => {
                entries.push(split_entry(&inner[start..index])?);
                start = index + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(KeyDecodeError::NotARecord {
            raw: raw.to_owned(),
        });
    }
    entries.push(split_entry(&inner[start..])?);
    Ok(entries)
}

fn split_entry(entry: &str) -> Result<(String, &str), KeyDecodeError> {
    match entry.split_once(':') {
        Some((name, value)) if !name.is_empty() => Ok((unescape(name)?, value)),
        _ => Err(KeyDecodeError::MalformedEntry {
            entry: entry.to_owned(),
        }),
    }
}

fn is_reserved(byte: u8) -> bool {
    matches!(
        byte,
        b'%' | b'(' | b')' | b',' | b':' | b'\''
            | b'/' | b'?' | b'#' | b'[' | b']' | b'@'
            | b'&' | b'=' | b'+'
    ) || byte.is_ascii_whitespace()
}

/// 百分号转义键值中的保留字符。
pub fn escape(text: &str) -> String {
    percent_encode(text, is_reserved)
}

/// 将字符串转义为可直接拼入 URL 路径段或查询值的形式。
///
/// 仅保留 RFC 3986 的 unreserved 与 sub-delims（以及 `:` `@`），其余字节全部转义。
pub fn escape_path_segment(text: &str) -> String {
    percent_encode(text, |byte| {
        !(byte.is_ascii_alphanumeric()
            || matches!(
                byte,
                b'-' | b'.'
                    | b'_'
                    | b'~'
                    | b'!'
                    | b'$'
                    | b'&'
                    | b'\''
                    | b'('
                    | b')'
                    | b'*'
                    | b'+'
                    | b','
                    | b';'
                    | b'='
                    | b':'
                    | b'@'
            ))
    })
}

fn percent_encode(text: &str, needs_escape: impl Fn(u8) -> bool) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        if needs_escape(byte) || !byte.is_ascii() {
            // 写入 String 不会失败。
            let _ = write!(out, "%{byte:02X}");
        } else {
            out.push(char::from(byte));
        }
    }
    out
}

/// 反转义百分号序列；多字节序列需还原为合法 UTF-8。
pub fn unescape(raw: &str) -> Result<String, KeyDecodeError> {
    let invalid = || KeyDecodeError::InvalidEscape {
        raw: raw.to_owned(),
    };
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = bytes.get(index + 1..index + 3).ok_or_else(invalid)?;
            let hex = std::str::from_utf8(hex).map_err(|_| invalid())?;
            out.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
            index += 3;
        } else {
            out.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid())
}
