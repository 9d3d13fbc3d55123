pub mod credentials;
pub mod upstream;

pub use credentials::StaticCredentials;
pub use upstream::HttpUpstream;
