use hsa_kmd::driver::Driver;
use hsa_kmd::runtime::{Agent, HeapType, MemoryRegion};
use hsa_kmd::{DriverConfig, HsaResult, KfdDriver, init_logging};

fn main() -> HsaResult<()> {
    init_logging();
    let mut driver: KfdDriver = KfdDriver::new(DriverConfig::from_env());

    println!("[+] Opening {}...", driver.devnode_name().display());
    driver.open()?;
    driver.init()?;
    let version = driver.version();
    println!("[+] KFD interface version {}.{}", version.major, version.minor);

    let node_count = driver.topology().map_or(0, |t| t.nodes.len());
    for node_id in 0..node_count as u32 {
        let mut agent = Agent::new(node_id);
        driver.get_agent_properties(&mut agent)?;
        println!(
            "  Node {node_id}: {:?} {:?}, {} cores, {} MiB local",
            agent.device_type,
            agent.name,
            agent.num_cores,
            agent.local_mem_size >> 20
        );

        for heap_type in [HeapType::System, HeapType::FrameBufferPublic, HeapType::FrameBufferPrivate] {
            let mut region = MemoryRegion {
                heap_type,
                ..MemoryRegion::system(node_id)
            };
            if driver.get_memory_properties(node_id, &mut region).is_ok() {
                println!("    {heap_type:?}: {} MiB", region.size >> 20);
            }
        }
    }

    driver.close()
}
