pub mod audio;
pub mod raster;
