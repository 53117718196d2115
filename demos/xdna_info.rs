use hsa_kmd::driver::Driver;
use hsa_kmd::runtime::{Agent, AllocateFlags, MemoryRegion, Queue};
use hsa_kmd::{DriverConfig, HsaResult, XdnaDriver, init_logging};

fn main() -> HsaResult<()> {
    init_logging();
    let config = DriverConfig::from_env();

    println!("[+] Scanning {} for amdxdna nodes...", config.accel_dev_dir.display());
    let driver: XdnaDriver = match XdnaDriver::discover_driver(&config) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("[-] No usable XDNA device: {e}");
            return Err(e);
        }
    };
    let version = driver.version();
    println!(
        "[+] {} ({}), AIE version {}.{}",
        driver.devnode_name().display(),
        driver.kernel_driver_type(),
        version.major,
        version.minor
    );

    let mut agent = Agent::new(driver.node_id());
    driver.get_agent_properties(&mut agent)?;
    println!(
        "    {}: {} cols x {} rows, {} core tiles, {} MiB device heap",
        agent.name,
        agent.num_cols,
        agent.num_rows,
        agent.num_cores,
        agent.local_mem_size >> 20
    );

    let region = MemoryRegion::device_local(agent.node_id);
    let mem = driver.allocate_memory(&region, AllocateFlags::new(), 4096, agent.node_id)?;
    println!("[+] Device BO at {mem:p}");

    let mut queue = Queue::new(0, agent.node_id);
    driver.create_queue(&mut queue)?;
    println!(
        "[+] Hardware context {:?}, doorbell offset {:#x}",
        queue.hw_ctx_handle(),
        queue.doorbell_offset()
    );

    driver.destroy_queue(&mut queue)?;
    driver.free_memory(mem, 4096)?;
    println!("[+] Done");
    Ok(())
}
