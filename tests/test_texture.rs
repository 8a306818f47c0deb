use exatex::{
    ContainerLayout, DecompressError, ReconstructError, Texture, TextureError, TextureState,
};
use image::Rgba;
use std::{
    fs,
    path::Path,
    sync::{mpsc, Arc},
};

/// Builds a texture container around an already compressed payload.
fn container(width: u32, height: u32, payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 60];
    data[4..8].copy_from_slice(&width.to_le_bytes());
    data[8..12].copy_from_slice(&height.to_le_bytes());
    data.extend_from_slice(payload);
    data
}

/// A square texture whose payload is one long literal-only block.
fn large_container(side: u32) -> Vec<u8> {
    let length = (4 * side * side) as usize;

    let mut payload = vec![0xf0];
    let mut rest = length - 15;
    while rest >= 255 {
        payload.push(255);
        rest -= 255;
    }
    payload.push(rest as u8);
    payload.resize(payload.len() + length, 0x7f);

    container(side, side, &payload)
}

/// A 2x1 texture stored as a single literal-only block.
fn two_pixel_container() -> Vec<u8> {
    container(2, 1, &[0x80, 255, 0, 0, 255, 0, 0, 255, 255])
}

fn load(name: &str, data: &[u8]) -> Result<Texture, TextureError> {
    Texture::from_bytes(name, data, &ContainerLayout::default())
}

#[test]
fn test_inbuilt_layout() {
    let layout = ContainerLayout::default();

    assert_eq!(layout.name, "exapunks");
    assert_eq!(layout.extension, "tex");
    assert_eq!(layout.width_offset, 4);
    assert_eq!(layout.height_offset, 8);
    assert_eq!(layout.payload_offset, 60);
}

#[test]
fn test_custom_layout() -> anyhow::Result<()> {
    let layout = ContainerLayout::parse(
        r#"
        name = "custom"
        width_offset = 0
        height_offset = 4
        payload_offset = 8
        "#,
    )?;

    assert_eq!(layout.extension, "tex");

    let mut data = Vec::new();
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(&[0x40, 9, 8, 7, 6]);

    let texture = Texture::from_bytes("custom", &data, &layout)?;
    let image = texture.decode()?.expect("decode was not cancelled");

    assert_eq!(image.get_pixel(0, 0), &Rgba([9, 8, 7, 6]));

    Ok(())
}

#[test]
fn test_invalid_layout() {
    assert!(ContainerLayout::parse("name = \"broken\"").is_err());
}

#[test]
fn test_texture_names() {
    let layout = ContainerLayout::default();

    assert_eq!(layout.texture_name(Path::new("textures/wall.tex")), "wall");
    assert_eq!(layout.texture_name(Path::new("wall.tex.bak")), "wall");
    assert_eq!(layout.texture_name(Path::new("wall.png")), "wall.png");

    assert!(layout.is_texture_path(Path::new("wall.tex")));
    assert!(layout.is_texture_path(Path::new("WALL.TEX")));
    assert!(!layout.is_texture_path(Path::new("wall.png")));
}

#[test]
fn test_header() -> anyhow::Result<()> {
    let texture = load("sample", &two_pixel_container())?;

    assert_eq!(texture.name(), "sample");
    assert_eq!(texture.file_name(), "sample.tex");
    assert_eq!(texture.width(), 2);
    assert_eq!(texture.height(), 1);
    assert_eq!(texture.payload_len(), 9);
    assert_eq!(texture.title(), "sample.tex (2×1)");
    assert_eq!(
        texture.crc(),
        crc32fast::hash(&[0x80, 255, 0, 0, 255, 0, 0, 255, 255])
    );
    assert!(texture.is_decoding());
    assert_eq!(texture.progress(), 0.0);

    Ok(())
}

#[test]
fn test_malformed_containers() {
    let layout = ContainerLayout::default();

    let too_short_for_header = vec![0u8; 10];
    assert!(matches!(
        Texture::from_bytes("short", &too_short_for_header, &layout),
        Err(TextureError::MalformedContainer(_))
    ));

    let too_short_for_payload = vec![0u8; 40];
    assert!(matches!(
        Texture::from_bytes("short", &too_short_for_payload, &layout),
        Err(TextureError::MalformedContainer(_))
    ));
}

#[test]
fn test_decode() -> anyhow::Result<()> {
    let texture = load("sample", &two_pixel_container())?;

    let image = texture.decode()?.expect("decode was not cancelled");

    assert_eq!(image.dimensions(), (2, 1));
    assert_eq!(image.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
    assert_eq!(image.get_pixel(1, 0), &Rgba([0, 0, 255, 255]));

    assert!(!texture.is_decoding());
    assert_eq!(texture.progress(), 1.0);

    let again = texture.decode()?.expect("decode was not cancelled");
    assert!(Arc::ptr_eq(&image, &again));

    Ok(())
}

#[test]
fn test_decode_flips_rows() -> anyhow::Result<()> {
    // 1x2: bottom row red, top row blue
    let data = container(1, 2, &[0x80, 255, 0, 0, 255, 0, 0, 255, 255]);
    let texture = load("tall", &data)?;

    let image = texture.decode()?.expect("decode was not cancelled");

    assert_eq!(image.get_pixel(0, 0), &Rgba([0, 0, 255, 255]));
    assert_eq!(image.get_pixel(0, 1), &Rgba([255, 0, 0, 255]));

    Ok(())
}

#[test]
fn test_cancelled_decode_can_be_retried() -> anyhow::Result<()> {
    let texture = load("sample", &two_pixel_container())?;

    texture.cancel();
    assert!(texture.decode()?.is_none());
    assert!(texture.is_decoding());

    let image = texture.decode()?.expect("retry was not cancelled");
    assert_eq!(image.dimensions(), (2, 1));

    // cancelling a decoded texture does nothing
    texture.cancel();
    assert!(matches!(texture.state(), TextureState::Decoded(_)));

    Ok(())
}

#[test]
fn test_decode_async() -> anyhow::Result<()> {
    let texture = load("sample", &two_pixel_container())?;

    let (tx, rx) = mpsc::channel();
    let worker = texture.decode_async(move |result| {
        tx.send(result).expect("Receiver dropped");
    });

    worker
        .expect("texture was not decoded yet")
        .join()
        .expect("Decoder thread panicked");

    let image = rx.recv()??.expect("decode was not cancelled");
    assert_eq!(image.get_pixel(1, 0), &Rgba([0, 0, 255, 255]));
    assert!(matches!(texture.state(), TextureState::Decoded(_)));

    // decoded textures complete right away
    let (tx, rx) = mpsc::channel();
    let worker = texture.decode_async(move |result| {
        tx.send(result).expect("Receiver dropped");
    });

    assert!(worker.is_none());
    assert!(Arc::ptr_eq(
        &image,
        &rx.recv()??.expect("decode was not cancelled")
    ));

    Ok(())
}

#[test]
fn test_overlapping_async_decodes() -> anyhow::Result<()> {
    let texture = load("large", &large_container(2048))?;

    let (tx, rx) = mpsc::channel();
    let first = {
        let tx = tx.clone();
        texture.decode_async(move |result| {
            tx.send(result).expect("Receiver dropped");
        })
    };
    let second = texture.decode_async(move |result| {
        tx.send(result).expect("Receiver dropped");
    });

    // the second request rides along with the running decode
    assert!(second.is_none());
    first
        .expect("texture was not decoded yet")
        .join()
        .expect("Decoder thread panicked");

    let a = rx.recv()??.expect("decode was not cancelled");
    let b = rx.recv()??.expect("decode was not cancelled");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.dimensions(), (2048, 2048));
    assert!(matches!(texture.state(), TextureState::Decoded(_)));

    Ok(())
}

#[test]
fn test_decode_waits_for_running_decode() -> anyhow::Result<()> {
    let texture = load("large", &large_container(2048))?;

    let (tx, rx) = mpsc::channel();
    let worker = texture.decode_async(move |result| {
        tx.send(result).expect("Receiver dropped");
    });

    let image = texture.decode()?.expect("decode was not cancelled");

    worker
        .expect("texture was not decoded yet")
        .join()
        .expect("Decoder thread panicked");

    let from_worker = rx.recv()??.expect("decode was not cancelled");
    assert!(Arc::ptr_eq(&image, &from_worker));

    Ok(())
}

#[test]
fn test_truncated_payload() -> anyhow::Result<()> {
    let data = container(2, 1, &[0x80, 255, 0, 0]);
    let texture = load("truncated", &data)?;

    assert!(matches!(
        texture.decode(),
        Err(TextureError::Decompress(DecompressError::UnexpectedEnd { .. }))
    ));

    Ok(())
}

#[test]
fn test_payload_smaller_than_image() -> anyhow::Result<()> {
    let data = container(4, 4, &[0x80, 255, 0, 0, 255, 0, 0, 255, 255]);
    let texture = load("small", &data)?;

    assert!(matches!(
        texture.decode(),
        Err(TextureError::Reconstruct(ReconstructError::SizeMismatch {
            expected: 64,
            actual: 8,
            ..
        }))
    ));
    assert!(texture.is_decoding());

    Ok(())
}

#[test]
fn test_open() -> anyhow::Result<()> {
    let dir = std::env::temp_dir().join(format!("exatex-test-{}", std::process::id()));
    fs::create_dir_all(&dir)?;

    let path = dir.join("panel.tex");
    fs::write(&path, two_pixel_container())?;

    let texture = Texture::open(&path, &ContainerLayout::default())?;
    assert_eq!(texture.name(), "panel");
    assert_eq!(texture.title(), "panel.tex (2×1)");
    assert!(texture.decode()?.is_some());

    assert!(matches!(
        Texture::open(dir.join("missing.tex"), &ContainerLayout::default()),
        Err(TextureError::Read(_))
    ));

    fs::remove_dir_all(&dir)?;

    Ok(())
}
