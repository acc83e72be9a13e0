//! Canonical command codes. The values are part of the legacy client
//! contract and must not change.

/// A protocol command code as carried in the frame header.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(u16)]
pub enum Command {
    // Session control.
    Init = 0x0001,
    Keepalive = 0x0002,
    Logout = 0x0003,
    ReloadUser = 0x0004,

    // Chat.
    Chat = 0x0101,
    Whisper = 0x0102,
    PartyChat = 0x0103,
    GuildChat = 0x0104,

    // Movement.
    Move = 0x0201,
    Teleport = 0x0202,
    TeleportConfirm = 0x0203,

    // Combat.
    Attack = 0x0301,
    Defense = 0x0302,
    Damage = 0x0303,
    Spell = 0x0304,

    // Inventory, trade, shop.
    GetItem = 0x0401,
    DropItem = 0x0402,
    UseItem = 0x0403,
    Trade = 0x0404,
    TradeConfirm = 0x0405,
    TradeCancel = 0x0406,
    Shop = 0x0407,
    SkillLevel = 0x0408,

    // System and account.
    SavePosition = 0x0501,
    Revival = 0x0502,
    AccountLogin = 0x0503,
    CharacterLogin = 0x0504,
    CharacterCreate = 0x0505,
    CharacterDelete = 0x0506,

    // Guild.
    GuildCreate = 0x0601,
    GuildDisband = 0x0602,
    GuildInvite = 0x0603,
    GuildAccept = 0x0604,
    GuildReject = 0x0605,
    GuildKick = 0x0606,
    GuildMember = 0x0607,

    // Misc.
    UpdateEquip = 0x0701,
    QuestUpdate = 0x0702,
    QuestComplete = 0x0703,
    PartyInvite = 0x0704,
    PartyAccept = 0x0705,
    PartyReject = 0x0706,
    PartyLeave = 0x0707,
    PartyKick = 0x0708,

    // Admin and world events.
    AdminCommand = 0x0901,
    GmCommand = 0x0902,
    WeatherUpdate = 0x0903,
    WorldEvent = 0x0904,
    SystemMessage = 0x0905,
}

impl Command {
    /// Decodes a raw command code, returning `None` for codes outside the
    /// protocol.
    pub const fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x0001 => Self::Init,
            0x0002 => Self::Keepalive,
            0x0003 => Self::Logout,
            0x0004 => Self::ReloadUser,
            0x0101 => Self::Chat,
            0x0102 => Self::Whisper,
            0x0103 => Self::PartyChat,
            0x0104 => Self::GuildChat,
            0x0201 => Self::Move,
            0x0202 => Self::Teleport,
            0x0203 => Self::TeleportConfirm,
            0x0301 => Self::Attack,
            0x0302 => Self::Defense,
            0x0303 => Self::Damage,
            0x0304 => Self::Spell,
            0x0401 => Self::GetItem,
            0x0402 => Self::DropItem,
            0x0403 => Self::UseItem,
            0x0404 => Self::Trade,
            0x0405 => Self::TradeConfirm,
            0x0406 => Self::TradeCancel,
            0x0407 => Self::Shop,
            0x0408 => Self::SkillLevel,
            0x0501 => Self::SavePosition,
            0x0502 => Self::Revival,
            0x0503 => Self::AccountLogin,
            0x0504 => Self::CharacterLogin,
            0x0505 => Self::CharacterCreate,
            0x0506 => Self::CharacterDelete,
            0x0601 => Self::GuildCreate,
            0x0602 => Self::GuildDisband,
            0x0603 => Self::GuildInvite,
            0x0604 => Self::GuildAccept,
            0x0605 => Self::GuildReject,
            0x0606 => Self::GuildKick,
            0x0607 => Self::GuildMember,
            0x0701 => Self::UpdateEquip,
            0x0702 => Self::QuestUpdate,
            0x0703 => Self::QuestComplete,
            0x0704 => Self::PartyInvite,
            0x0705 => Self::PartyAccept,
            0x0706 => Self::PartyReject,
            0x0707 => Self::PartyLeave,
            0x0708 => Self::PartyKick,
            0x0901 => Self::AdminCommand,
            0x0902 => Self::GmCommand,
            0x0903 => Self::WeatherUpdate,
            0x0904 => Self::WorldEvent,
            0x0905 => Self::SystemMessage,
            _ => return None,
        })
    }

    pub const fn to_raw(self) -> u16 {
        self as u16
    }
}
