//! 城堡攻防领域：战场实体解码、游戏内命令、CastleAgent

pub mod agent;
pub mod commands;
pub mod game_objects;

pub use agent::CastleAgent;
pub use commands::{game_commands, CommandsWellFormed, MOVE_IN_DIRECTION, MOVE_TO_TARGET};
pub use game_objects::{
    battle_state, decode_battlefield, pretty_list, DecodeError, EntityKind, Fighter, FighterType, GameObject,
    ObjectBase, Structure,
};
