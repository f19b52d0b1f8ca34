//! Synthesizes an RSS 2.0 document from a [`PodcastInfo`], rewriting each
//! episode's enclosure to the pipeline's own `/process` URL. Used by the
//! `/rss` route, which must hand back a feed the client's podcast app can
//! subscribe to directly.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::writer::Writer;
use std::io::Cursor;

use crate::model::PodcastInfo;

pub fn render(podcast: &PodcastInfo) -> String {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    write_decl(&mut writer);

    writer.write_event(Event::Start(rss_start())).ok();
    writer.write_event(Event::Start(BytesStart::new("channel"))).ok();

    write_text_element(&mut writer, "title", &podcast.title);
    if let Some(description) = &podcast.description {
        write_text_element(&mut writer, "description", description);
    }
    if let Some(link) = &podcast.link {
        write_text_element(&mut writer, "link", link);
    }

    for episode in &podcast.episodes {
        writer.write_event(Event::Start(BytesStart::new("item"))).ok();
        write_text_element(&mut writer, "title", &episode.title);
        if let Some(description) = &episode.description {
            write_text_element(&mut writer, "description", description);
        }
        if let Some(published) = &episode.published {
            write_text_element(&mut writer, "pubDate", &published.to_rfc2822());
        }

        let mut enclosure = BytesStart::new("enclosure");
        enclosure.push_attribute(("url", episode.audio_url.as_str()));
        enclosure.push_attribute(("type", "audio/mpeg"));
        writer.write_event(Event::Empty(enclosure)).ok();

        writer.write_event(Event::End(BytesEnd::new("item"))).ok();
    }

    writer.write_event(Event::End(BytesEnd::new("channel"))).ok();
    writer.write_event(Event::End(rss_end())).ok();

    String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
}

fn write_decl<W: std::io::Write>(writer: &mut Writer<W>) {
    writer
        .write_event(Event::Decl(quick_xml::events::BytesDecl::new("1.0", Some("UTF-8"), None)))
        .ok();
}

fn rss_start() -> BytesStart<'static> {
    let mut start = BytesStart::new("rss");
    start.push_attribute(("version", "2.0"));
    start
}

fn rss_end() -> BytesEnd<'static> {
    BytesEnd::new("rss")
}

fn write_text_element<W: std::io::Write>(writer: &mut Writer<W>, name: &str, text: &str) {
    writer.write_event(Event::Start(BytesStart::new(name))).ok();
    writer.write_event(Event::Text(BytesText::new(text))).ok();
    writer.write_event(Event::End(BytesEnd::new(name))).ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EpisodeInfo;

    #[test]
    fn renders_channel_metadata_and_one_enclosure_per_episode() {
        let podcast = PodcastInfo {
            title: "Example Show".to_string(),
            description: Some("A podcast".to_string()),
            link: Some("https://example.com".to_string()),
            episodes: vec![EpisodeInfo {
                title: "Episode 1".to_string(),
                description: Some("The first one".to_string()),
                published: None,
                audio_url: "https://host/process?url=https://cdn/ep1.mp3".to_string(),
                original_url: Some("https://cdn/ep1.mp3".to_string()),
            }],
        };

        let xml = render(&podcast);

        assert!(xml.contains("<rss version=\"2.0\">"));
        assert!(xml.contains("<title>Example Show</title>"));
        assert!(xml.contains("url=\"https://host/process?url=https://cdn/ep1.mp3\""));
    }

    #[test]
    fn renders_an_empty_episode_list_as_a_channel_with_no_items() {
        let podcast = PodcastInfo { title: "Empty".to_string(), description: None, link: None, episodes: vec![] };

        let xml = render(&podcast);

        assert!(xml.contains("<title>Empty</title>"));
        assert!(!xml.contains("<item>"));
    }
}
