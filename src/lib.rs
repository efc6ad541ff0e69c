mod arena;
mod assemble;
mod engine;
mod error;
mod fixups;
mod image;
mod load;
mod oracle;
mod process;
mod queue;
mod ranges;
mod recipe;
mod roots;
mod stream;

pub use arena::ArenaMode;
pub use engine::FlattenOptions;
pub use engine::Flattener;
pub use error::Error;
pub use error::Result;
pub use image::ImageHeader;
pub use image::IMAGE_MAGIC;
pub use image::IMAGE_VERSION;
pub use load::LoadOptions;
pub use load::Loader;
pub use load::SymbolResolver;
pub use oracle::Memory;
pub use process::ProcessMemory;
pub use ranges::FlatPtr;
pub use ranges::RangeId;
pub use recipe::PostConvert;
pub use recipe::PreExtract;
pub use recipe::RecipeCtx;
pub use recipe::RecipeFn;
pub use recipe::RootCtx;
