use byteorder::{BigEndian, ReadBytesExt};
use image::{GrayImage, Luma, Rgb, RgbImage};
use iwave_encoder::{
    ChromaMode, ChunkStatus, ChunkTarget, EncoderSession, SessionParams,
};
use std::io::Read;

/// Walks a chunk's self-delimiting framing, returning (bit plane, band,
/// payload length) per slice. Panics if the framing does not tile the chunk
/// exactly.
fn parse_slices(mut chunk: &[u8]) -> Vec<(u8, u8, usize)> {
    let mut slices = Vec::new();
    while !chunk.is_empty() {
        let bit = chunk.read_u8().unwrap();
        let band = chunk.read_u8().unwrap();
        let len = chunk.read_u32::<BigEndian>().unwrap() as usize;
        let mut payload = vec![0u8; len];
        chunk.read_exact(&mut payload).unwrap();
        slices.push((bit, band, len));
    }
    slices
}

fn gray_test_image(width: u32, height: u32) -> Vec<u8> {
    GrayImage::from_fn(width, height, |x, y| Luma([((x + y) % 256) as u8])).into_raw()
}

/// Encode a grayscale image one chunk at a time until the session reports
/// DONE, checking the chunk framing along the way.
#[test]
fn test_grayscale_encoding_runs_to_completion() {
    let img = gray_test_image(32, 32);
    let mut session =
        EncoderSession::new_gray(&img, 32, 32, None, SessionParams::default()).unwrap();

    let mut total_bytes = 0usize;
    let mut chunk_count = 0;
    loop {
        let chunk = session
            .encode_chunk(&ChunkTarget { slices: Some(10), ..Default::default() })
            .unwrap();
        assert!(!chunk.data.is_empty(), "chunk {} is empty", chunk_count);
        let slices = parse_slices(&chunk.data);
        assert!(!slices.is_empty());
        total_bytes += chunk.data.len();
        chunk_count += 1;

        if chunk.status == ChunkStatus::Done {
            break;
        }
        assert!(chunk_count < 100, "too many chunks generated");
    }

    assert_eq!(session.bytes_so_far() as usize, total_bytes);
    assert!(session.is_done());
    println!("encoded {} chunks totaling {} bytes", chunk_count, total_bytes);
}

/// A slice-count budget of 3 on a fresh session runs exactly 3 slice
/// encodings.
#[test]
fn test_slice_count_budget() {
    let img = gray_test_image(16, 16);
    let mut session =
        EncoderSession::new_gray(&img, 16, 16, None, SessionParams::default()).unwrap();
    let chunk = session
        .encode_chunk(&ChunkTarget { slices: Some(3), ..Default::default() })
        .unwrap();
    assert_eq!(session.slices_so_far(), 3);
    assert_eq!(parse_slices(&chunk.data).len(), 3);
}

/// A byte budget is a hard cap up to slice granularity: the chunk may only
/// cross the budget by the bytes of its final slice.
#[test]
fn test_byte_budget_respects_slice_boundaries() {
    let img = gray_test_image(64, 64);
    let mut session =
        EncoderSession::new_gray(&img, 64, 64, None, SessionParams::default()).unwrap();
    let budget = 600usize;
    let chunk = session
        .encode_chunk(&ChunkTarget { bytes: Some(budget), ..Default::default() })
        .unwrap();

    let slices = parse_slices(&chunk.data);
    let last_len = 6 + slices.last().unwrap().2;
    assert!(
        chunk.data.len() - last_len < budget,
        "budget was already exceeded before the final slice: {} - {} >= {}",
        chunk.data.len(),
        last_len,
        budget
    );
}

/// Slices inside a chunk follow the band-minor, bit-plane-major order.
#[test]
fn test_chunk_slices_follow_cursor_order() {
    let img = gray_test_image(32, 32);
    let mut session =
        EncoderSession::new_gray(&img, 32, 32, None, SessionParams::default()).unwrap();
    let chunk = session
        .encode_chunk(&ChunkTarget { slices: Some(25), ..Default::default() })
        .unwrap();

    let slices = parse_slices(&chunk.data);
    assert_eq!(slices.len(), 25);
    let start_bit = slices[0].0;
    for (i, &(bit, band, _)) in slices.iter().enumerate() {
        assert_eq!(band as usize, i % 10, "band must cycle through 0..10");
        assert_eq!(bit as usize, start_bit as usize - i / 10, "bit plane must step down per wrap");
    }
}

/// Encoding a color image interleaves chroma slices and still terminates.
#[test]
fn test_rgb_encoding_with_chroma() {
    let img = RgbImage::from_fn(32, 32, |x, y| {
        Rgb([((x * 8) % 256) as u8, ((y * 8) % 256) as u8, (((x + y) * 4) % 256) as u8])
    })
    .into_raw();

    let params = SessionParams { chroma_mode: ChromaMode::Full, ..Default::default() };
    let mut session = EncoderSession::new_rgb(&img, 32, 32, None, params).unwrap();
    let mut gray_session = {
        let params = SessionParams { chroma_mode: ChromaMode::None, ..Default::default() };
        EncoderSession::new_rgb(&img, 32, 32, None, params).unwrap()
    };

    let target = ChunkTarget { slices: Some(10), ..Default::default() };
    let color_chunk = session.encode_chunk(&target).unwrap();
    let luma_chunk = gray_session.encode_chunk(&target).unwrap();

    assert!(
        color_chunk.data.len() > luma_chunk.data.len(),
        "chroma slices should add bytes: {} vs {}",
        color_chunk.data.len(),
        luma_chunk.data.len()
    );
    assert_eq!(session.slices_so_far(), 10, "chroma slices must not count toward the budget");

    let mut chunks = 1;
    loop {
        let chunk = session.encode_chunk(&target).unwrap();
        chunks += 1;
        if chunk.status == ChunkStatus::Done {
            break;
        }
        assert!(chunks < 100);
    }
}

/// A masked session excludes the masked region but still encodes.
#[test]
fn test_masked_encoding() {
    let width = 32u32;
    let height = 32u32;
    let img = gray_test_image(width, height);

    let mut mask = vec![0u8; (width * height) as usize];
    for y in height / 4..3 * height / 4 {
        for x in width / 4..3 * width / 4 {
            mask[(y * width + x) as usize] = 255;
        }
    }

    let mut session =
        EncoderSession::new_gray(&img, 32, 32, Some(&mask), SessionParams::default()).unwrap();
    let chunk = session
        .encode_chunk(&ChunkTarget { slices: Some(5), ..Default::default() })
        .unwrap();
    assert!(!chunk.data.is_empty(), "masked encoded chunk is empty");
}

/// The decibel gate never produces more data than an unbounded encode of the
/// same image, and the session still reaches DONE.
#[test]
fn test_decibel_target_is_an_early_exit() {
    let img = gray_test_image(32, 32);

    let full_bytes = {
        let mut session =
            EncoderSession::new_gray(&img, 32, 32, None, SessionParams::default()).unwrap();
        loop {
            if session
                .encode_chunk(&ChunkTarget { slices: Some(50), ..Default::default() })
                .unwrap()
                .status
                == ChunkStatus::Done
            {
                break;
            }
        }
        session.bytes_so_far()
    };

    let mut session =
        EncoderSession::new_gray(&img, 32, 32, None, SessionParams::default()).unwrap();
    let mut chunks = 0;
    loop {
        let chunk = session
            .encode_chunk(&ChunkTarget {
                slices: Some(50),
                decibels: Some(20.0),
                ..Default::default()
            })
            .unwrap();
        chunks += 1;
        if chunk.status == ChunkStatus::Done {
            break;
        }
        assert!(chunks < 100);
    }
    assert!(session.bytes_so_far() <= full_bytes);
}

/// Progress queries are idempotent.
#[test]
fn test_progress_queries_do_not_mutate() {
    let img = gray_test_image(16, 16);
    let mut session =
        EncoderSession::new_gray(&img, 16, 16, None, SessionParams::default()).unwrap();
    session
        .encode_chunk(&ChunkTarget { slices: Some(2), ..Default::default() })
        .unwrap();
    let first = (session.slices_so_far(), session.bytes_so_far());
    for _ in 0..10 {
        assert_eq!((session.slices_so_far(), session.bytes_so_far()), first);
    }
}
