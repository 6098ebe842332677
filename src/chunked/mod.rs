mod decoder;
mod encoder;

pub(crate) use decoder::ChunkedDecoder;
pub(crate) use encoder::ChunkedEncoder;
