use bytes::{BufMut, Bytes, BytesMut};
use rill::{Emit, Filter, MemorySink, MemorySource, Options, Readable, Runtime, Transform, Writable};

/// Run length encoder carrying the open run across chunk boundaries.
struct Rle {
    run: Option<(u8, usize)>,
}

impl Transform for Rle {
    fn transform(&mut self, chunk: Bytes, out: Emit) {
        let mut encoded = BytesMut::new();
        for &byte in chunk.iter() {
            match &mut self.run {
                Some((b, n)) if *b == byte => *n += 1,
                run => {
                    if let Some((b, n)) = run.take() {
                        put_run(&mut encoded, b, n);
                    }
                    *run = Some((byte, 1));
                }
            }
        }
        if !encoded.is_empty() {
            out.chunk(encoded.freeze());
        }
        out.done();
    }

    fn finish(&mut self, out: Emit) {
        if let Some((b, n)) = self.run.take() {
            let mut encoded = BytesMut::new();
            put_run(&mut encoded, b, n);
            out.chunk(encoded.freeze());
        }
        out.done();
    }
}

fn put_run(buf: &mut BytesMut, byte: u8, count: usize) {
    buf.put_slice(count.to_string().as_bytes());
    buf.put_u8(byte);
}

fn main() {
    let rt = Runtime::new();

    let input = "aaaaabbbcccccccccccdd";
    let src = Readable::new(
        rt.handle(),
        Options::default(),
        MemorySource::new(input).chunk_size(4),
    );

    let filter = Filter::new(rt.handle(), Options::default(), Rle { run: None });

    let sink = MemorySink::new();
    let out = sink.data();
    let dest = Writable::new(rt.handle(), Options::default(), sink);

    src.pipe(filter.writable()).unwrap();
    filter.readable().pipe(&dest).unwrap();
    rt.run();

    println!("{input} -> {}", String::from_utf8_lossy(&out.concat()));
}
