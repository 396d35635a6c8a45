//! 战场实体与解码
//!
//! 客户端发来的记录形如 `{id, type, position, ...}`：
//! - `structure`：带 `ally` 为城堡，不带为城墙
//! - `unit`：需要 `ally`、`name`、`fighterType`；knight / archer 为预设兵种，其余兵种还需要 `isRanged`
//! - 其他 type 降级为通用实体并记录警告，不会报错
//!
//! 注入沙箱的 `battle_state` 使用 snake_case 记录（见 [`GameObject::to_state_record`]）。

use serde_json::{Map, Value};
use thiserror::Error;

use crate::sandbox::Value as PyValue;

/// 已知类型记录缺字段或字段类型不对
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("game object must be a JSON object, got {0}")]
    NotAnObject(String),

    #[error("{object_type} record is missing field '{field}'")]
    MissingField { object_type: String, field: &'static str },

    #[error("field '{field}' must be {expected}")]
    InvalidField { field: &'static str, expected: &'static str },
}

/// 所有实体共有的字段
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectBase {
    pub object_id: Value,
    pub object_type: String,
    pub position: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Structure {
    Castle { ally: bool },
    /// 城墙不属于任何一方
    Wall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FighterType {
    Knight,
    Archer,
    Other(String),
}

impl FighterType {
    pub fn from_name(name: &str) -> Self {
        FIGHTER_PRESETS
            .iter()
            .find(|(preset, _, _)| *preset == name)
            .map(|(_, kind, _)| kind.clone())
            .unwrap_or_else(|| FighterType::Other(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            FighterType::Knight => "knight",
            FighterType::Archer => "archer",
            FighterType::Other(name) => name,
        }
    }

    /// 预设兵种的远程属性；非预设兵种返回 None
    pub fn preset_is_ranged(&self) -> Option<bool> {
        FIGHTER_PRESETS
            .iter()
            .find(|(_, kind, _)| kind == self)
            .map(|(_, _, ranged)| *ranged)
    }
}

/// 预设兵种表：名称、兵种、是否远程
const FIGHTER_PRESETS: &[(&str, FighterType, bool)] = &[
    ("knight", FighterType::Knight, false),
    ("archer", FighterType::Archer, true),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Fighter {
    pub ally: bool,
    pub name: String,
    pub is_ranged: bool,
    pub fighter_type: FighterType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    Structure(Structure),
    Unit(Fighter),
    /// 未知 type 的降级实体，只有公共字段
    Generic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameObject {
    pub base: ObjectBase,
    pub kind: EntityKind,
}

type KindDecoder = fn(&Map<String, Value>) -> Result<EntityKind, DecodeError>;

/// type 字段到解码函数的映射
const DECODERS: &[(&str, KindDecoder)] = &[("structure", decode_structure), ("unit", decode_unit)];

fn decode_structure(record: &Map<String, Value>) -> Result<EntityKind, DecodeError> {
    let structure = match record.get("ally") {
        Some(_) => Structure::Castle {
            ally: bool_field(record, "ally")?,
        },
        None => Structure::Wall,
    };
    Ok(EntityKind::Structure(structure))
}

fn decode_unit(record: &Map<String, Value>) -> Result<EntityKind, DecodeError> {
    let ally = bool_field(record, "ally")?;
    let name = str_field(record, "unit", "name")?;
    let fighter_type = FighterType::from_name(&str_field(record, "unit", "fighterType")?);
    let is_ranged = match fighter_type.preset_is_ranged() {
        Some(ranged) => ranged,
        None => bool_field(record, "isRanged")?,
    };
    Ok(EntityKind::Unit(Fighter {
        ally,
        name,
        is_ranged,
        fighter_type,
    }))
}

fn required<'a>(
    record: &'a Map<String, Value>,
    object_type: &str,
    field: &'static str,
) -> Result<&'a Value, DecodeError> {
    record.get(field).ok_or_else(|| DecodeError::MissingField {
        object_type: object_type.to_string(),
        field,
    })
}

fn str_field(record: &Map<String, Value>, object_type: &str, field: &'static str) -> Result<String, DecodeError> {
    required(record, object_type, field)?
        .as_str()
        .map(String::from)
        .ok_or(DecodeError::InvalidField {
            field,
            expected: "a string",
        })
}

fn bool_field(record: &Map<String, Value>, field: &'static str) -> Result<bool, DecodeError> {
    let object_type = record.get("type").and_then(|t| t.as_str()).unwrap_or("unknown");
    required(record, object_type, field)?
        .as_bool()
        .ok_or(DecodeError::InvalidField {
            field,
            expected: "a boolean",
        })
}

impl GameObject {
    /// 解码单条客户端记录
    pub fn from_record(record: &Value) -> Result<Self, DecodeError> {
        let map = record
            .as_object()
            .ok_or_else(|| DecodeError::NotAnObject(record.to_string()))?;
        let object_type = map.get("type").and_then(|t| t.as_str()).unwrap_or_default().to_string();
        let base = ObjectBase {
            object_id: required(map, &object_type, "id")?.clone(),
            position: required(map, &object_type, "position")?.clone(),
            object_type,
        };
        let kind = match DECODERS.iter().find(|(name, _)| *name == base.object_type) {
            Some((_, decode)) => decode(map)?,
            None => {
                tracing::warn!(record = %record, "creating unknown object");
                EntityKind::Generic
            }
        };
        Ok(Self { base, kind })
    }

    pub fn ally(&self) -> Option<bool> {
        match &self.kind {
            EntityKind::Structure(Structure::Castle { ally }) => Some(*ally),
            EntityKind::Unit(fighter) => Some(fighter.ally),
            EntityKind::Structure(Structure::Wall) | EntityKind::Generic => None,
        }
    }

    /// 注入沙箱 `battle_state` 的记录；城墙带 `ally: null`，通用实体只有公共字段
    pub fn to_state_record(&self) -> Value {
        let mut record = Map::new();
        record.insert("object_id".into(), self.base.object_id.clone());
        record.insert("object_type".into(), Value::String(self.base.object_type.clone()));
        record.insert("position".into(), self.base.position.clone());
        match &self.kind {
            EntityKind::Structure(Structure::Castle { ally }) => {
                record.insert("ally".into(), Value::Bool(*ally));
            }
            EntityKind::Structure(Structure::Wall) => {
                record.insert("ally".into(), Value::Null);
            }
            EntityKind::Unit(fighter) => {
                record.insert("ally".into(), Value::Bool(fighter.ally));
                record.insert("name".into(), Value::String(fighter.name.clone()));
                record.insert("is_ranged".into(), Value::Bool(fighter.is_ranged));
                record.insert(
                    "fighter_type".into(),
                    Value::String(fighter.fighter_type.as_str().to_string()),
                );
            }
            EntityKind::Generic => {}
        }
        Value::Object(record)
    }

    /// 日志用的多行展示：字符串加引号，其余按 Python 风格输出
    pub fn pretty(&self) -> String {
        let mut lines = vec!["{".to_string()];
        if let Value::Object(record) = self.to_state_record() {
            for (key, value) in &record {
                lines.push(format!("    {}: {},", key, PyValue::from_json(value).repr()));
            }
        }
        lines.push("}".to_string());
        lines.join("\n")
    }
}

/// 解码整个战场
pub fn decode_battlefield(records: &[Value]) -> Result<Vec<GameObject>, DecodeError> {
    records.iter().map(GameObject::from_record).collect()
}

pub fn pretty_list(objects: &[GameObject]) -> String {
    objects.iter().map(GameObject::pretty).collect::<Vec<_>>().join("\n")
}

/// `battle_state` 列表
pub fn battle_state(objects: &[GameObject]) -> Vec<Value> {
    objects.iter().map(GameObject::to_state_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_castle_and_wall() {
        let castle = GameObject::from_record(&json!({"id": 1, "type": "structure", "position": {"x": 0, "y": 0}, "ally": true})).unwrap();
        assert_eq!(castle.kind, EntityKind::Structure(Structure::Castle { ally: true }));
        assert_eq!(castle.base.object_type, "structure");

        let wall = GameObject::from_record(&json!({"id": 2, "type": "structure", "position": {"x": 3, "y": 1}})).unwrap();
        assert_eq!(wall.kind, EntityKind::Structure(Structure::Wall));
        assert_eq!(wall.ally(), None);
        assert_eq!(wall.to_state_record()["ally"], Value::Null);
    }

    #[test]
    fn test_decode_units_with_presets() {
        let knight = GameObject::from_record(&json!({
            "id": 5, "type": "unit", "position": {"x": 1, "y": 1},
            "ally": true, "name": "Arthur", "isRanged": true, "fighterType": "knight"
        }))
        .unwrap();
        match &knight.kind {
            EntityKind::Unit(f) => {
                assert_eq!(f.fighter_type, FighterType::Knight);
                // 预设兵种忽略记录中的 isRanged
                assert!(!f.is_ranged);
            }
            other => panic!("unexpected kind {:?}", other),
        }

        let archer = GameObject::from_record(&json!({
            "id": 6, "type": "unit", "position": {"x": 2, "y": 1},
            "ally": false, "name": "Robin", "fighterType": "archer"
        }))
        .unwrap();
        assert_eq!(archer.to_state_record()["is_ranged"], true);
        assert_eq!(archer.ally(), Some(false));
    }

    #[test]
    fn test_decode_other_fighter_keeps_is_ranged() {
        let mage = GameObject::from_record(&json!({
            "id": 7, "type": "unit", "position": {"x": 0, "y": 4},
            "ally": true, "name": "Merlin", "isRanged": true, "fighterType": "mage"
        }))
        .unwrap();
        let record = mage.to_state_record();
        assert_eq!(record["fighter_type"], "mage");
        assert_eq!(record["is_ranged"], true);

        let err = GameObject::from_record(&json!({
            "id": 8, "type": "unit", "position": {"x": 0, "y": 4},
            "ally": true, "name": "Nameless", "fighterType": "mage"
        }))
        .unwrap_err();
        assert_eq!(
            err,
            DecodeError::MissingField {
                object_type: "unit".into(),
                field: "isRanged"
            }
        );
    }

    #[test]
    fn test_unknown_type_degrades_to_generic() {
        let tree = GameObject::from_record(&json!({"id": "t1", "type": "tree", "position": {"x": 9, "y": 9}, "height": 3})).unwrap();
        assert_eq!(tree.kind, EntityKind::Generic);
        assert_eq!(
            tree.to_state_record(),
            json!({"object_id": "t1", "object_type": "tree", "position": {"x": 9, "y": 9}})
        );
    }

    #[test]
    fn test_missing_unit_fields_are_errors() {
        let err = GameObject::from_record(&json!({"id": 1, "type": "unit", "position": [0, 0], "ally": true})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField { field: "name", .. }));
        assert!(GameObject::from_record(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_state_record_field_order() {
        let knight = GameObject::from_record(&json!({
            "id": 5, "type": "unit", "position": {"x": 1, "y": 1},
            "ally": true, "name": "Arthur", "fighterType": "knight"
        }))
        .unwrap();
        let record = knight.to_state_record();
        let keys: Vec<&String> = record.as_object().unwrap().keys().collect();
        assert_eq!(
            keys,
            vec!["object_id", "object_type", "position", "ally", "name", "is_ranged", "fighter_type"]
        );
    }

    #[test]
    fn test_pretty_print() {
        let castle = GameObject::from_record(&json!({"id": 1, "type": "structure", "position": {"x": 0, "y": 2}, "ally": false})).unwrap();
        assert_eq!(
            castle.pretty(),
            "{\n    object_id: 1,\n    object_type: 'structure',\n    position: {'x': 0, 'y': 2},\n    ally: False,\n}"
        );
    }
}
