// Embedded Client Assets
//
// The 1x1 transparent GIF answered to beacon requests and the tracker
// script served to pages. Served with a strong ETag so browsers can
// revalidate cheaply.

/// 43-byte transparent 1x1 GIF89a.
pub const BEACON_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, // GIF89a
    0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, // 1x1, palette of 2
    0x00, 0x00, 0x00, 0xff, 0xff, 0xff, // black, white
    0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, // GCE, transparent
    0x2c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, // image descriptor
    0x02, 0x02, 0x44, 0x01, 0x00, // 1 clear-coded pixel
    0x3b, // trailer
];

pub const TRACKER_JS: &str = r#"(function () {
  'use strict';

  var script = document.currentScript;
  var endpoint = script && script.getAttribute('data-endpoint');
  var appId = script && script.getAttribute('data-app-id');
  if (!endpoint || !appId) return;

  function param(name, value) {
    return value ? '&' + name + '=' + encodeURIComponent(value) : '';
  }

  function track() {
    var img = new Image(1, 1);
    img.src = endpoint + '/v1/beacon.gif?app_id=' + encodeURIComponent(appId)
      + param('url', location.href)
      + param('referrer', document.referrer)
      + param('screen_resolution', screen.width + 'x' + screen.height)
      + param('language', navigator.language)
      + param('timezone', Intl.DateTimeFormat().resolvedOptions().timeZone);
  }

  if (document.readyState === 'complete') {
    track();
  } else {
    window.addEventListener('load', track);
  }
})();
"#;

pub const TRACKER_MIN_JS: &str = "(function(){'use strict';var s=document.currentScript,e=s&&s.getAttribute('data-endpoint'),a=s&&s.getAttribute('data-app-id');if(!e||!a)return;function p(n,v){return v?'&'+n+'='+encodeURIComponent(v):''}function t(){var i=new Image(1,1);i.src=e+'/v1/beacon.gif?app_id='+encodeURIComponent(a)+p('url',location.href)+p('referrer',document.referrer)+p('screen_resolution',screen.width+'x'+screen.height)+p('language',navigator.language)+p('timezone',Intl.DateTimeFormat().resolvedOptions().timeZone)}document.readyState==='complete'?t():window.addEventListener('load',t)})();\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gif_is_exactly_43_bytes_with_trailer() {
        assert_eq!(BEACON_GIF.len(), 43);
        assert_eq!(&BEACON_GIF[..6], b"GIF89a");
        assert_eq!(BEACON_GIF[42], 0x3b);
    }

    #[test]
    fn tracker_variants_hit_the_same_endpoint() {
        assert!(TRACKER_JS.contains("/v1/beacon.gif"));
        assert!(TRACKER_MIN_JS.contains("/v1/beacon.gif"));
    }
}
