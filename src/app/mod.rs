pub mod engagement;
pub mod feed;
pub mod posts;
pub mod session;
