use serde::{Deserialize, Serialize};

pub use cs2bin::BaseKind;

/// A value type in the source language.
///
/// The VM itself only knows three stacks (int, string, long); everything
/// else is a semantic alias carrying the same representation but a distinct
/// meaning for printing and checking. The one-byte codes are the wire codes
/// used in script headers and signature parameter lists; several int-backed
/// kinds deliberately share the plain int code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    // Primitives
    Int,
    Boolean,
    Char,
    Long,
    String,

    // Int-backed semantic aliases
    Widget,
    Item,
    NamedItem,
    Npc,
    NpcUid,
    Color,
    Anim,
    Map,
    MapElement,
    Graphic,
    Skill,
    Texture,
    Sound,
    Location,
    LocShape,
    Area,
    Struct,
    Enum,
    DbRow,
    DbColumn,
    DbField,
    DbTable,
    Category,
    Container,
    Model,
    Sprite,
    FontMetrics,
    Overlay,
    TopLevel,

    /// A script reference passed as an int (not a real wire type).
    Callback,
    /// Inference placeholder, compatible with everything.
    Unknown,
}

impl Type {
    /// Source keyword for this type.
    pub fn keyword(self) -> &'static str {
        match self {
            Type::Int => "int",
            Type::Boolean => "boolean",
            Type::Char => "char",
            Type::Long => "long",
            Type::String => "string",
            Type::Widget => "widget",
            Type::Item => "item",
            Type::NamedItem => "nameditem",
            Type::Npc => "npc",
            Type::NpcUid => "npcuid",
            Type::Color => "color",
            Type::Anim => "anim",
            Type::Map => "map",
            Type::MapElement => "mapelement",
            Type::Graphic => "graphic",
            Type::Skill => "skill",
            Type::Texture => "texture",
            Type::Sound => "sound",
            Type::Location => "location",
            Type::LocShape => "locshape",
            Type::Area => "area",
            Type::Struct => "struct",
            Type::Enum => "enum",
            Type::DbRow => "dbrow",
            Type::DbColumn => "dbcolumn",
            Type::DbField => "dbfield",
            Type::DbTable => "dbtable",
            Type::Category => "category",
            Type::Container => "container",
            Type::Model => "model",
            Type::Sprite => "sprite",
            Type::FontMetrics => "fontmetrics",
            Type::Overlay => "overlay",
            Type::TopLevel => "toplevel",
            Type::Callback => "callback",
            Type::Unknown => "unknown",
        }
    }

    /// Resolve a source keyword.
    pub fn from_keyword(kw: &str) -> Option<Type> {
        ALL.iter().copied().find(|t| t.keyword() == kw)
    }

    /// One-byte wire code used in script headers.
    pub fn code(self) -> u8 {
        match self {
            Type::Boolean => b'1',
            Type::Char => b'z',
            Type::Long => cs2bin::types::CODE_LONG,
            Type::String => cs2bin::types::CODE_STRING,
            Type::Widget => b'I',
            Type::Item => b'o',
            Type::NamedItem => b'O',
            Type::Npc => b'n',
            Type::NpcUid => b'u',
            Type::Anim => b'A',
            Type::Map => b'`',
            Type::MapElement => 0xB5,
            Type::Graphic => b't',
            Type::Skill => b'S',
            Type::Texture => b'x',
            Type::Sound => b'P',
            Type::Location => b'c',
            Type::LocShape => b'H',
            Type::Area => b'R',
            Type::Struct => b'J',
            Type::Enum => b'g',
            Type::DbRow => 0xD0,
            Type::Category => b'y',
            Type::Container => b'v',
            Type::Model => b'm',
            Type::Sprite => b'd',
            Type::FontMetrics => b'f',
            Type::Overlay => b'L',
            Type::TopLevel => b'F',
            Type::Callback | Type::Unknown => 0,
            // Color and the db cursor kinds share the plain int code.
            Type::Int | Type::Color | Type::DbColumn | Type::DbField | Type::DbTable => b'i',
        }
    }

    /// Resolve a wire code to its canonical type. Codes shared between
    /// several aliases resolve to the first (plain) kind; unknown codes
    /// resolve to `Int`, matching the original editor's behavior.
    pub fn from_code(code: u8) -> Type {
        match code {
            0 => Type::Unknown,
            b'1' => Type::Boolean,
            b'z' => Type::Char,
            cs2bin::types::CODE_LONG => Type::Long,
            cs2bin::types::CODE_STRING => Type::String,
            b'I' => Type::Widget,
            b'o' => Type::Item,
            b'O' => Type::NamedItem,
            b'n' => Type::Npc,
            b'u' => Type::NpcUid,
            b'A' => Type::Anim,
            b'`' => Type::Map,
            0xB5 => Type::MapElement,
            b't' => Type::Graphic,
            b'S' => Type::Skill,
            b'x' => Type::Texture,
            b'P' => Type::Sound,
            b'c' => Type::Location,
            b'H' => Type::LocShape,
            b'R' => Type::Area,
            b'J' => Type::Struct,
            b'g' => Type::Enum,
            0xD0 => Type::DbRow,
            b'y' => Type::Category,
            b'v' => Type::Container,
            b'm' => Type::Model,
            b'd' => Type::Sprite,
            b'f' => Type::FontMetrics,
            b'L' => Type::Overlay,
            b'F' => Type::TopLevel,
            _ => Type::Int,
        }
    }

    /// Which VM stack values of this type live on.
    pub fn base(self) -> BaseKind {
        match self {
            Type::String => BaseKind::String,
            Type::Long => BaseKind::Long,
            _ => BaseKind::Int,
        }
    }

    /// Compatibility is by base kind; `unknown` unifies with anything.
    pub fn compatible(self, other: Type) -> bool {
        self == Type::Unknown || other == Type::Unknown || self.base() == other.base()
    }

    /// Default semantic type for a base kind.
    pub fn of_base(kind: BaseKind) -> Type {
        match kind {
            BaseKind::Int => Type::Int,
            BaseKind::String => Type::String,
            BaseKind::Long => Type::Long,
        }
    }
}

const ALL: &[Type] = &[
    Type::Int,
    Type::Boolean,
    Type::Char,
    Type::Long,
    Type::String,
    Type::Widget,
    Type::Item,
    Type::NamedItem,
    Type::Npc,
    Type::NpcUid,
    Type::Color,
    Type::Anim,
    Type::Map,
    Type::MapElement,
    Type::Graphic,
    Type::Skill,
    Type::Texture,
    Type::Sound,
    Type::Location,
    Type::LocShape,
    Type::Area,
    Type::Struct,
    Type::Enum,
    Type::DbRow,
    Type::DbColumn,
    Type::DbField,
    Type::DbTable,
    Type::Category,
    Type::Container,
    Type::Model,
    Type::Sprite,
    Type::FontMetrics,
    Type::Overlay,
    Type::TopLevel,
    Type::Callback,
    Type::Unknown,
];

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_round_trip() {
        for &ty in ALL {
            assert_eq!(Type::from_keyword(ty.keyword()), Some(ty));
        }
    }

    #[test]
    fn codes_round_trip_up_to_aliasing() {
        for &ty in ALL {
            let back = Type::from_code(ty.code());
            assert_eq!(back.base(), ty.base(), "{ty}");
        }
        assert_eq!(Type::from_code(b'i'), Type::Int);
        assert_eq!(Type::from_code(b's'), Type::String);
    }

    #[test]
    fn compatibility_is_by_base_kind() {
        assert!(Type::Widget.compatible(Type::Int));
        assert!(Type::Color.compatible(Type::Item));
        assert!(!Type::String.compatible(Type::Int));
        assert!(Type::Unknown.compatible(Type::String));
    }
}
