//! Basic usage example for the imlink wire protocol.

use bytes::Bytes;
use imlink_wire::{
    ContentType, FrameBuilder, FrameParser, MessageType, ParserConfig, TlvBuilder,
    TransformRegistry, HEADER_SIZE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== imlink Wire Protocol Example ===\n");

    // 1. Build a TLV body and frame it
    println!("1. Building a text message frame...");
    let body = TlvBuilder::new()
        .text(ContentType::Text, "Hello, imlink!")
        .u32(0x0100, 7)
        .build()?;

    let registry = TransformRegistry::new();
    let frame = FrameBuilder::new(MessageType::Normal, 0x0000_0001, 0x1F2E)
        .body(body)
        .build(&registry)?;

    println!(
        "   Encoded frame size: {} bytes ({} header + {} body)",
        frame.len(),
        HEADER_SIZE,
        frame.len() - HEADER_SIZE
    );

    // 2. Feed it back in small fragments, as a socket would deliver it
    println!("\n2. Parsing the frame from 5-byte fragments...");
    let mut parser = FrameParser::new(ParserConfig::default());
    let mut stream = frame.clone();
    stream = Bytes::from([stream.as_ref(), frame.as_ref()].concat());

    let mut packets = Vec::new();
    for piece in stream.chunks(5) {
        parser.feed(piece);
        while let Some(packet) = parser.next_packet()? {
            packets.push(packet);
        }
    }

    println!("   Parsed {} packets", packets.len());
    for packet in &packets {
        println!(
            "   seq=0x{:08X} type={:?} session=0x{:04X}",
            packet.header.sequence, packet.header.msg_type, packet.header.session_id
        );
        if let Some(tlv) = &packet.tlv {
            if let Some(text) = tlv.get(&ContentType::Text.tag()).and_then(|v| v.as_str()) {
                println!("   text: {}", text);
            }
        }
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
