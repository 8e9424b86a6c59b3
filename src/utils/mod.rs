mod stream_ext;

pub use stream_ext::StreamExt;
