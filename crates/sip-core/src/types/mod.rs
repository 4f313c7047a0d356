pub mod address;
pub mod auth;
pub mod body;
pub mod cseq;
pub mod headers;
pub mod host;
pub mod method;
pub mod param;
pub mod rack;
pub mod reason;
pub mod uri;
pub mod via;
