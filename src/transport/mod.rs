/// Filesystem helpers: atomic replace, optional reads, directory listing.
pub mod fs;
