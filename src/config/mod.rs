pub mod settings;

pub use settings::TransportSettings;
