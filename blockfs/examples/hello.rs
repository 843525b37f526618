use blockfs::{Filesystem, FileBlockEmulatorBuilder, FormatOptions};

/// Formats a throwaway disk image, creates a handful of files, and prints
/// what the engine sees.
pub fn main() {
    let disk = tempfile::tempfile().expect("no temp file");
    let dev = FileBlockEmulatorBuilder::from(disk)
        .with_block_count(256)
        .with_block_size(1024)
        .build()
        .expect("could not prepare the disk image");

    let opts = FormatOptions {
        total_blocks: 256,
        block_size: 1024,
        inode_size: 128,
    };
    let fs = Filesystem::format(dev, &opts).expect("format failed");
    let geo = *fs.geometry();
    println!(
        "formatted: {} blocks, {} inodes, data region at block {}",
        geo.blocks_count, geo.inodes_count, geo.data_start
    );

    let root = fs.root().expect("no root directory");
    for name in ["hello", "world", "a-much-longer-file-name"].iter() {
        fs.create(&root, name.as_bytes(), 0o100644).expect("create failed");
    }

    // Grow one file past the direct slots so the indirect path runs.
    let found = fs.find_entry(&root, b"hello").expect("lookup failed").unwrap();
    let hello = fs.inode(found.ino).expect("load failed");
    for iblock in 0..9 {
        let blocknr = fs
            .get_block(&hello, iblock, true)
            .expect("allocation failed")
            .unwrap();
        println!("hello logical block {} -> physical block {}", iblock, blocknr);
    }

    println!("directory listing:");
    for entry in fs.read_dir(&root).expect("read_dir failed") {
        println!(
            "  ino {:3}  {:?}  {}",
            entry.ino,
            entry.file_type,
            String::from_utf8_lossy(&entry.name)
        );
    }

    let (free_inodes, free_blocks) = fs.free_counts();
    println!("{} free inodes, {} free data blocks", free_inodes, free_blocks);
}
