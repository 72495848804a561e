use rill::{MemorySink, MemorySource, Options, Readable, Runtime, Signal, Writable};

// RUST_LOG=debug cargo run --example pipe --features log
fn main() {
    env_logger::init();

    let rt = Runtime::new();

    let src = Readable::new(
        rt.handle(),
        Options::new().high_water(64).low_water(16),
        MemorySource::new("the quick brown fox jumps over the lazy dog").chunk_size(8),
    );

    let sink = MemorySink::new();
    let data = sink.data();
    let dest = Writable::new(rt.handle(), Options::new().high_water(16).low_water(8), sink);

    dest.once(Signal::Pipe, |_| println!("[pipe] attached"));
    dest.on(Signal::Drain, |_| println!("[drain] room again"));
    dest.once(Signal::Finish, |_| println!("[finish] all flushed"));

    src.pipe(&dest).unwrap();
    rt.run();

    println!("delivered: {:?}", String::from_utf8_lossy(&data.concat()));
}
