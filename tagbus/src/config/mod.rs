pub mod settings;

pub use settings::{BusSettings, Settings, SettingsError, TagDeclaration};
