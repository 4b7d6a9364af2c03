//! Contract ABI definitions and the binary row/action decoder.
//!
//! Table rows and action payloads arrive as packed little-endian binary.
//! An [`Abi`] names the struct behind every table and action; decoding walks
//! that struct and produces a JSON value handlers can read.
//!
//! Supported types: `bool`, `uint8..uint64`, `int8..int64`, `varuint32`,
//! `varint32`, `float64`, `name`, `string`, `bytes`, `checksum256`, `asset`,
//! `symbol`, `symbol_code`, `time_point`, `time_point_sec`, typedefs, structs
//! (with base structs), optionals `T?`, arrays `T[]` and binary extensions `T$`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Errors produced while decoding packed binary.
#[derive(Debug, Error, PartialEq)]
pub enum AbiError {
    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("unexpected end of data at offset {offset} reading {ty}")]
    UnexpectedEof { offset: usize, ty: String },

    #[error("{remaining} trailing bytes after {ty}")]
    TrailingBytes { remaining: usize, ty: String },

    #[error("invalid {ty} at offset {offset}")]
    Invalid { offset: usize, ty: String },

    #[error("type nesting deeper than {0}")]
    TooDeep(usize),
}

const MAX_DEPTH: usize = 32;

// ─── ABI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Abi {
    #[serde(default)]
    pub types: Vec<AbiTypeDef>,
    #[serde(default)]
    pub structs: Vec<AbiStruct>,
    #[serde(default)]
    pub actions: Vec<AbiAction>,
    #[serde(default)]
    pub tables: Vec<AbiTable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbiTypeDef {
    pub new_type_name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbiStruct {
    pub name: String,
    #[serde(default)]
    pub base: String,
    pub fields: Vec<AbiField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbiField {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbiAction {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbiTable {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

impl Abi {
    /// Parse an ABI from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Struct type stored in `table`, if the ABI declares it.
    pub fn table_type(&self, table: &str) -> Option<&str> {
        self.tables.iter().find(|t| t.name == table).map(|t| t.type_name.as_str())
    }

    /// Struct type of `action`'s payload, if the ABI declares it.
    pub fn action_type(&self, action: &str) -> Option<&str> {
        self.actions.iter().find(|a| a.name == action).map(|a| a.type_name.as_str())
    }

    /// Build the lookup form used for decoding.
    pub fn compile(&self) -> CompiledAbi {
        CompiledAbi {
            typedefs: self
                .types
                .iter()
                .map(|t| (t.new_type_name.clone(), t.type_name.clone()))
                .collect(),
            structs: self.structs.iter().map(|s| (s.name.clone(), s.clone())).collect(),
            tables: self
                .tables
                .iter()
                .map(|t| (t.name.clone(), t.type_name.clone()))
                .collect(),
            actions: self
                .actions
                .iter()
                .map(|a| (a.name.clone(), a.type_name.clone()))
                .collect(),
        }
    }
}

/// An ABI indexed for decoding.
#[derive(Debug, Clone, Default)]
pub struct CompiledAbi {
    typedefs: HashMap<String, String>,
    structs: HashMap<String, AbiStruct>,
    tables: HashMap<String, String>,
    actions: HashMap<String, String>,
}

impl CompiledAbi {
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }

    /// Decode a row of `table`. `None` if the table is not in the ABI.
    pub fn decode_table_row(&self, table: &str, data: &[u8]) -> Option<Result<Value, AbiError>> {
        self.tables.get(table).map(|ty| self.decode(ty, data))
    }

    /// Decode an action payload. `None` if the action is not in the ABI.
    pub fn decode_action(&self, action: &str, data: &[u8]) -> Option<Result<Value, AbiError>> {
        self.actions.get(action).map(|ty| self.decode(ty, data))
    }

    /// Decode `data` as exactly one value of `ty`.
    pub fn decode(&self, ty: &str, data: &[u8]) -> Result<Value, AbiError> {
        let mut reader = BinReader::new(data);
        let value = self.read_type(&mut reader, ty, 0)?;
        if reader.remaining() > 0 {
            return Err(AbiError::TrailingBytes {
                remaining: reader.remaining(),
                ty: ty.to_string(),
            });
        }
        Ok(value)
    }

    fn resolve<'a>(&'a self, mut ty: &'a str) -> &'a str {
        // typedef chains are short; bound them anyway
        for _ in 0..MAX_DEPTH {
            match self.typedefs.get(ty) {
                Some(next) => ty = next,
                None => break,
            }
        }
        ty
    }

    fn read_type(&self, r: &mut BinReader<'_>, ty: &str, depth: usize) -> Result<Value, AbiError> {
        if depth > MAX_DEPTH {
            return Err(AbiError::TooDeep(MAX_DEPTH));
        }
        if let Some(inner) = ty.strip_suffix("[]") {
            let len = r.varuint32(ty)? as usize;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(self.read_type(r, inner, depth + 1)?);
            }
            return Ok(Value::Array(items));
        }
        if let Some(inner) = ty.strip_suffix('?') {
            return match r.u8(ty)? {
                0 => Ok(Value::Null),
                1 => self.read_type(r, inner, depth + 1),
                _ => Err(r.invalid(ty)),
            };
        }
        if let Some(inner) = ty.strip_suffix('$') {
            if r.remaining() == 0 {
                return Ok(Value::Null);
            }
            return self.read_type(r, inner, depth + 1);
        }

        let resolved = self.resolve(ty);
        if let Some(value) = read_builtin(r, resolved)? {
            return Ok(value);
        }
        match self.structs.get(resolved) {
            Some(def) => {
                let mut object = Map::new();
                self.read_struct(r, def, &mut object, depth + 1)?;
                Ok(Value::Object(object))
            }
            None => Err(AbiError::UnknownType(resolved.to_string())),
        }
    }

    fn read_struct(
        &self,
        r: &mut BinReader<'_>,
        def: &AbiStruct,
        out: &mut Map<String, Value>,
        depth: usize,
    ) -> Result<(), AbiError> {
        if depth > MAX_DEPTH {
            return Err(AbiError::TooDeep(MAX_DEPTH));
        }
        if !def.base.is_empty() {
            let base_name = self.resolve(&def.base);
            let base = self
                .structs
                .get(base_name)
                .ok_or_else(|| AbiError::UnknownType(base_name.to_string()))?;
            self.read_struct(r, base, out, depth + 1)?;
        }
        for field in &def.fields {
            if field.type_name.ends_with('$') && r.remaining() == 0 {
                continue;
            }
            let value = self.read_type(r, &field.type_name, depth + 1)?;
            out.insert(field.name.clone(), value);
        }
        Ok(())
    }
}

fn read_builtin(r: &mut BinReader<'_>, ty: &str) -> Result<Option<Value>, AbiError> {
    let value = match ty {
        "bool" => match r.u8(ty)? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            _ => return Err(r.invalid(ty)),
        },
        "uint8" => json!(r.u8(ty)?),
        "int8" => json!(r.u8(ty)? as i8),
        "uint16" => json!(u16::from_le_bytes(r.array(ty)?)),
        "int16" => json!(i16::from_le_bytes(r.array(ty)?)),
        "uint32" => json!(u32::from_le_bytes(r.array(ty)?)),
        "int32" => json!(i32::from_le_bytes(r.array(ty)?)),
        "uint64" => json!(u64::from_le_bytes(r.array(ty)?)),
        "int64" => json!(i64::from_le_bytes(r.array(ty)?)),
        "varuint32" => json!(r.varuint32(ty)?),
        "varint32" => {
            let raw = r.varuint32(ty)?;
            // zigzag
            json!(((raw >> 1) as i32) ^ -((raw & 1) as i32))
        }
        "float64" => {
            let f = f64::from_bits(u64::from_le_bytes(r.array(ty)?));
            serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
        }
        "name" => Value::String(name_to_string(u64::from_le_bytes(r.array(ty)?))),
        "string" => {
            let len = r.varuint32(ty)? as usize;
            let offset = r.pos;
            let bytes = r.take(len, ty)?;
            let s = std::str::from_utf8(bytes).map_err(|_| AbiError::Invalid {
                offset,
                ty: ty.to_string(),
            })?;
            Value::String(s.to_string())
        }
        "bytes" => {
            let len = r.varuint32(ty)? as usize;
            Value::String(hex::encode(r.take(len, ty)?))
        }
        "checksum256" => Value::String(hex::encode(r.take(32, ty)?)),
        "symbol_code" => Value::String(symbol_code_to_string(u64::from_le_bytes(r.array(ty)?))),
        "symbol" => {
            let raw = u64::from_le_bytes(r.array(ty)?);
            Value::String(format!("{},{}", raw & 0xff, symbol_code_to_string(raw >> 8)))
        }
        "asset" => {
            let amount = i64::from_le_bytes(r.array(ty)?);
            let symbol = u64::from_le_bytes(r.array(ty)?);
            Value::String(format_asset(amount, symbol))
        }
        "time_point_sec" => {
            let secs = u32::from_le_bytes(r.array(ty)?);
            Value::String(format_time(secs as i64, 0))
        }
        "time_point" => {
            let micros = i64::from_le_bytes(r.array(ty)?);
            let secs = micros.div_euclid(1_000_000);
            let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
            Value::String(format_time(secs, nanos))
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn format_time(secs: i64, nanos: u32) -> String {
    match chrono::DateTime::from_timestamp(secs, nanos) {
        Some(t) if nanos == 0 => t.format("%Y-%m-%dT%H:%M:%S").to_string(),
        Some(t) => t.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        None => secs.to_string(),
    }
}

// ─── Binary reader ───────────────────────────────────────────────────────────

struct BinReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn invalid(&self, ty: &str) -> AbiError {
        AbiError::Invalid {
            offset: self.pos,
            ty: ty.to_string(),
        }
    }

    fn take(&mut self, n: usize, ty: &str) -> Result<&'a [u8], AbiError> {
        if self.remaining() < n {
            return Err(AbiError::UnexpectedEof {
                offset: self.pos,
                ty: ty.to_string(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self, ty: &str) -> Result<[u8; N], AbiError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, ty)?);
        Ok(out)
    }

    fn u8(&mut self, ty: &str) -> Result<u8, AbiError> {
        Ok(self.take(1, ty)?[0])
    }

    fn varuint32(&mut self, ty: &str) -> Result<u32, AbiError> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.u8(ty)?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 35 {
                return Err(self.invalid(ty));
            }
        }
        u32::try_from(value).map_err(|_| self.invalid(ty))
    }
}

// ─── Names, symbols, assets ──────────────────────────────────────────────────

const NAME_CHARS: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";

/// Decode a 64-bit account/table/action name (base-32, up to 13 chars).
pub fn name_to_string(value: u64) -> String {
    let mut out = [b'.'; 13];
    let mut tmp = value;
    for i in 0..13 {
        let (mask, shift) = if i == 0 { (0x0f, 4) } else { (0x1f, 5) };
        out[12 - i] = NAME_CHARS[(tmp & mask) as usize];
        tmp >>= shift;
    }
    let s = String::from_utf8_lossy(&out).into_owned();
    s.trim_end_matches('.').to_string()
}

/// Encode a name. Characters outside `.1-5a-z` map to `.`; input beyond 13 chars is ignored.
pub fn string_to_name(s: &str) -> u64 {
    fn symbol(c: u8) -> u64 {
        match c {
            b'a'..=b'z' => (c - b'a') as u64 + 6,
            b'1'..=b'5' => (c - b'1') as u64 + 1,
            _ => 0,
        }
    }
    let mut value = 0u64;
    for (i, c) in s.bytes().take(13).enumerate() {
        let v = symbol(c);
        if i < 12 {
            value |= (v & 0x1f) << (64 - 5 * (i + 1));
        } else {
            value |= v & 0x0f;
        }
    }
    value
}

fn symbol_code_to_string(mut code: u64) -> String {
    let mut out = String::new();
    while code > 0 {
        out.push((code & 0xff) as u8 as char);
        code >>= 8;
    }
    out
}

fn format_asset(amount: i64, symbol: u64) -> String {
    let precision = (symbol & 0xff) as u32;
    let code = symbol_code_to_string(symbol >> 8);
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    if precision == 0 {
        return format!("{sign}{abs} {code}");
    }
    let scale = 10u64.saturating_pow(precision);
    format!(
        "{sign}{}.{:0width$} {code}",
        abs / scale,
        abs % scale,
        width = precision as usize
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_ABI: &str = r#"{
        "types": [{"new_type_name": "account_name", "type": "name"}],
        "structs": [
            {"name": "account", "base": "", "fields": [{"name": "balance", "type": "asset"}]},
            {"name": "transfer", "base": "", "fields": [
                {"name": "from", "type": "account_name"},
                {"name": "to", "type": "name"},
                {"name": "quantity", "type": "asset"},
                {"name": "memo", "type": "string"}
            ]},
            {"name": "tagged", "base": "account", "fields": [
                {"name": "tags", "type": "string[]"},
                {"name": "note", "type": "string?"},
                {"name": "extra", "type": "uint32$"}
            ]}
        ],
        "actions": [{"name": "transfer", "type": "transfer"}],
        "tables": [{"name": "accounts", "type": "account"}]
    }"#;

    fn eos_symbol() -> u64 {
        // precision 4, code "EOS"
        4 | (u64::from_le_bytes(*b"EOS\0\0\0\0\0") << 8)
    }

    fn asset_bytes(amount: i64) -> Vec<u8> {
        let mut out = amount.to_le_bytes().to_vec();
        out.extend_from_slice(&eos_symbol().to_le_bytes());
        out
    }

    fn string_bytes(s: &str) -> Vec<u8> {
        let mut out = vec![s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out
    }

    #[test]
    fn names_match_known_values() {
        assert_eq!(string_to_name("eosio"), 6138663577826885632);
        assert_eq!(name_to_string(6138663577826885632), "eosio");
        for name in ["eosio.token", "alice", "a1b2c3d4e5", "zzzzzzzzzzzzj", ""] {
            assert_eq!(name_to_string(string_to_name(name)), name);
        }
    }

    #[test]
    fn assets_format_with_precision() {
        assert_eq!(format_asset(12_345, eos_symbol()), "1.2345 EOS");
        assert_eq!(format_asset(-5, eos_symbol()), "-0.0005 EOS");
        assert_eq!(format_asset(7, u64::from_le_bytes(*b"\0XYZ\0\0\0\0")), "7 XYZ");
    }

    #[test]
    fn decodes_table_row() {
        let abi = Abi::from_json(TOKEN_ABI).unwrap().compile();
        let row = abi.decode_table_row("accounts", &asset_bytes(10_000)).unwrap().unwrap();
        assert_eq!(row, json!({"balance": "1.0000 EOS"}));
        assert!(abi.decode_table_row("stat", &[]).is_none());
    }

    #[test]
    fn decodes_action_with_typedef_and_string() {
        let abi = Abi::from_json(TOKEN_ABI).unwrap().compile();
        let mut data = Vec::new();
        data.extend_from_slice(&string_to_name("alice").to_le_bytes());
        data.extend_from_slice(&string_to_name("bob").to_le_bytes());
        data.extend_from_slice(&asset_bytes(25_000));
        data.extend_from_slice(&string_bytes("rent"));

        let value = abi.decode_action("transfer", &data).unwrap().unwrap();
        assert_eq!(
            value,
            json!({"from": "alice", "to": "bob", "quantity": "2.5000 EOS", "memo": "rent"})
        );
    }

    #[test]
    fn decodes_base_arrays_optionals_and_extensions() {
        let abi = Abi::from_json(TOKEN_ABI).unwrap().compile();
        let mut data = asset_bytes(1);
        data.push(2);
        data.extend_from_slice(&string_bytes("a"));
        data.extend_from_slice(&string_bytes("b"));
        data.push(0); // note: none

        let value = abi.decode("tagged", &data).unwrap();
        assert_eq!(
            value,
            json!({"balance": "0.0001 EOS", "tags": ["a", "b"], "note": null})
        );

        data.extend_from_slice(&9u32.to_le_bytes());
        assert_eq!(abi.decode("tagged", &data).unwrap()["extra"], json!(9));
    }

    #[test]
    fn malformed_input_is_an_error() {
        let abi = Abi::from_json(TOKEN_ABI).unwrap().compile();
        assert!(matches!(
            abi.decode("account", &[1, 2, 3]),
            Err(AbiError::UnexpectedEof { .. })
        ));
        let mut long = asset_bytes(1);
        long.push(0);
        assert!(matches!(abi.decode("account", &long), Err(AbiError::TrailingBytes { .. })));
        assert!(matches!(abi.decode("nope", &[]), Err(AbiError::UnknownType(_))));
        assert!(matches!(abi.decode("bool", &[7]), Err(AbiError::Invalid { .. })));
    }

    #[test]
    fn scalar_types() {
        let abi = CompiledAbi::default();
        assert_eq!(abi.decode("varuint32", &[0xe5, 0x8e, 0x26]).unwrap(), json!(624_485));
        assert_eq!(abi.decode("varint32", &[3]).unwrap(), json!(-2));
        assert_eq!(abi.decode("int16", &(-3i16).to_le_bytes()).unwrap(), json!(-3));
        assert_eq!(abi.decode("float64", &1.5f64.to_le_bytes()).unwrap(), json!(1.5));
        assert_eq!(
            abi.decode("time_point_sec", &1_528_000_000u32.to_le_bytes()).unwrap(),
            json!("2018-06-03T04:26:40")
        );
        assert_eq!(abi.decode("symbol", &eos_symbol().to_le_bytes()).unwrap(), json!("4,EOS"));
        assert_eq!(abi.decode("checksum256", &[0xab; 32]).unwrap(), json!("ab".repeat(32)));
    }
}
