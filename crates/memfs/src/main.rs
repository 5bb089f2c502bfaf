use {
    async_trait::async_trait,
    clap::Parser,
    std::sync::{Arc, Mutex},
    styx::{
        file::{File, FileOps, FileSrv},
        srv::srv_async,
        *,
    },
};

/// A directory in the RAM tree. Files created here become [`RamFile`]s,
/// subdirectories become [`RamDir`]s, and anything may be removed.
struct RamDir;

#[async_trait]
impl FileOps for RamDir {
    async fn create(&self, dir: &Arc<File>, name: &str, perm: u32) -> Result<Arc<File>> {
        let ops: Arc<dyn FileOps> = if perm & dm::DIR != 0 {
            Arc::new(RamDir)
        } else {
            Arc::new(RamFile::new())
        };

        File::add(Some(dir), name, None, None, perm, ops)
    }

    async fn remove(&self, _dir: &Arc<File>, _file: &Arc<File>) -> Result<()> {
        Ok(())
    }
}

/// A file whose contents live in memory.
struct RamFile {
    data: Mutex<Vec<u8>>,
}

impl RamFile {
    fn new() -> RamFile {
        RamFile {
            data: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FileOps for RamFile {
    async fn read(&self, _file: &Arc<File>, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;

        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);

        Ok(n)
    }

    async fn write(&self, file: &Arc<File>, incoming: &[u8], offset: u64) -> Result<usize> {
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;

        if data.len() < offset + incoming.len() {
            data.resize(offset + incoming.len(), 0);
        }
        data[offset..offset + incoming.len()].copy_from_slice(incoming);

        let len = data.len() as u64;
        file.update_stat(|s| s.length = len);

        Ok(incoming.len())
    }

    async fn wstat(&self, file: &Arc<File>, stat: &Stat) -> Result<()> {
        // all-ones fields mean "leave alone" in a Twstat
        if stat.length != u64::MAX {
            let mut data = self.data.lock().unwrap();
            data.resize(stat.length as usize, 0);
            file.update_stat(|s| s.length = stat.length);
        }

        if stat.mode != u32::MAX {
            file.update_stat(|s| s.mode = stat.mode);
        }

        Ok(())
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,
}

async fn memfs_main(Cli { address }: Cli) -> styx::Result<i32> {
    let root = File::add(None, "/", None, None, dm::DIR | 0o775, Arc::new(RamDir))?;

    println!("[*] Ready to accept clients: {}", address);
    srv_async(FileSrv::new(root), &address).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = memfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
