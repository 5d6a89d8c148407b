use offload_buffers::{BufferManager, ChannelConfig, DeviceChannel, EmulatedChannel};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("============================================================");
    println!("              Offload Buffers - Round Trip Test             ");
    println!("============================================================");

    // 1. Bring up an emulated device
    let config = ChannelConfig::new().device_count(1).arena_size(16 << 20);
    let channel = EmulatedChannel::new(config);
    channel.open(0)?;
    println!(
        "[+] Device 0 open, {} bytes available",
        channel.available_memory(0)?
    );

    let mut mgr = BufferManager::new(channel);

    // 2. Host -> device -> host
    println!("[+] Allocating 4096-byte buffer (align 64)...");
    let h = mgr.allocate(0, 4096, 64)?;
    println!("    Device address: 0x{:x}", mgr.translate(h)?);

    let pattern = vec![0xABu8; 4096];
    mgr.copy_to_device(0, &pattern, h, 4096, 0, 0)?;

    let mut recovered = vec![0u8; 4096];
    mgr.copy_to_host(0, h, &mut recovered, 4096, 0, 0)?;
    println!(
        "    Round trip: {}",
        if recovered == pattern { "OK" } else { "MISMATCH" }
    );

    // 3. Device-local copy
    println!("[+] Copying 512 bytes between two device buffers...");
    let h1 = mgr.allocate(0, 1024, 0)?;
    let h2 = mgr.allocate(0, 1024, 0)?;

    let src: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
    mgr.copy_to_device(0, &src, h1, 1024, 0, 0)?;
    mgr.fill(0, h2, 0, 1024, 0)?;
    mgr.copy_on_device(0, h1, h2, 512, 0, 512)?;

    let mut out = vec![0u8; 1024];
    mgr.copy_to_host(0, h2, &mut out, 1024, 0, 0)?;
    println!(
        "    Device copy: {}",
        if out[512..] == src[..512] { "OK" } else { "MISMATCH" }
    );

    // 4. Cleanup
    for handle in [h, h1, h2] {
        mgr.release(0, handle)?;
    }
    println!("[+] Released all buffers, {} live", mgr.len());

    mgr.close_device(0)?;
    println!("[+] Device 0 closed");
    Ok(())
}
