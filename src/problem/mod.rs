mod mapping;

pub use mapping::ChannelMapping;
