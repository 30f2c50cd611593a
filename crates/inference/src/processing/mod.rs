pub mod post;
pub mod pre;

pub use post::{decode_yolo, non_max_suppression};
pub use pre::{DEFAULT_INPUT_SIZE, Letterbox, PreProcessor};
