mod client;

pub use client::{ApiError, ApiRequest, RequestMethod, StoryClient};
